//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Rowmap.
//
// Rowmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rowmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rowmap. If not, see <http://www.gnu.org/licenses/>.

//! CAPABILITY, NOOP, CHECK, LOGIN, LOGOUT.

use super::{CommandCtx, CommandResult, CAPABILITIES};
use crate::imap::response::{Code, Response, Tagged};
use crate::imap::session::ImapState;
use crate::support::logging::Severity;

pub(super) fn capability(tag: &str) -> CommandResult {
    CommandResult {
        responses: vec![Response::Capability(CAPABILITIES.to_vec())],
        tagged: Tagged::ok(tag, "done"),
    }
}

/// NOOP's entire point is the poll the session performs around every
/// command, so there is nothing left to do here.
pub(super) fn noop(tag: &str) -> CommandResult {
    CommandResult::tagged(Tagged::ok(tag, "done"))
}

pub(super) fn check(tag: &str, ctx: &CommandCtx) -> CommandResult {
    if ImapState::Selected != ctx.state.borrow().imap_state {
        return CommandResult::tagged(Tagged::bad(
            tag,
            "CHECK requires a selected mailbox",
        ));
    }

    CommandResult::tagged(Tagged::ok(tag, "done"))
}

pub(super) fn login(
    tag: &str,
    user: &str,
    password: &str,
    ctx: &CommandCtx,
) -> CommandResult {
    {
        let state = ctx.state.borrow();
        if ImapState::NotAuthenticated != state.imap_state {
            return CommandResult::tagged(Tagged::bad(
                tag,
                "already logged in",
            ));
        }
    }

    match ctx.runtime.authenticator.authenticate(user, password) {
        Ok(identity) => {
            let mut state = ctx.state.borrow_mut();
            state.user = Some(identity);
            state.imap_state = ImapState::Authenticated;
            CommandResult::tagged(
                Tagged::ok(tag, "logged in")
                    .with_code(Code::Capability(CAPABILITIES.to_vec())),
            )
        },
        Err(_) => CommandResult::tagged(Tagged::no(
            tag,
            "Login failed",
        )),
    }
}

pub(super) fn logout(tag: &str, ctx: &CommandCtx) -> CommandResult {
    {
        let mut state = ctx.state.borrow_mut();
        ctx.log.borrow_mut().log(
            Severity::Info,
            format!(
                "{} logging out",
                state.user.as_deref().unwrap_or("<anonymous>"),
            ),
        );
        state.imap_state = ImapState::Logout;
    }
    crate::imap::session::SessionNotify::detach(&ctx.notify, &ctx.runtime);

    CommandResult {
        responses: vec![Response::bye("logging out")],
        tagged: Tagged::ok(tag, "done"),
    }
}
