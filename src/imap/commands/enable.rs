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

//! The RFC 5161 ENABLE command. Really simple command.

use super::{CommandCtx, CommandResult, CAPABILITIES, ENABLEABLE};
use crate::imap::response::{Response, Tagged};

pub(super) fn enable(
    tag: &str,
    capabilities: &[String],
    ctx: &CommandCtx,
) -> CommandResult {
    let mut enabled = Vec::new();

    for capability in capabilities {
        if ENABLEABLE.iter().any(|e| e == capability) {
            let mut state = ctx.state.borrow_mut();
            // The ENABLED response only lists capabilities this command
            // newly enabled.
            let newly = match capability.as_str() {
                "CONDSTORE" => {
                    !std::mem::replace(&mut state.condstore, true)
                },
                "ANNOTATE" => {
                    !std::mem::replace(&mut state.annotate, true)
                },
                _ => unreachable!("capability listed but not handled"),
            };
            if newly {
                enabled.push(capability.clone());
            }
        } else if CAPABILITIES.iter().any(|c| c == capability) {
            // One of ours, but not one ENABLE may touch.
            return CommandResult::tagged(Tagged::bad(
                tag,
                format!(
                    "Capability {} is not subject to ENABLE",
                    capability,
                ),
            ));
        }
        // Capabilities we have never heard of are silently ignored.
    }

    CommandResult {
        responses: vec![Response::Enabled(enabled)],
        tagged: Tagged::ok(tag, "done"),
    }
}
