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

//! Request-scoped logging.
//!
//! Log lines for a single tagged request are buffered in a `RequestLog` and
//! committed together when the request completes. A successful request keeps
//! only `Info` and above; a failed one flushes everything, including `Debug`
//! lines that would otherwise be noise. `Disaster` is never buffered: it goes
//! to stderr immediately in addition to the normal pipeline, because by
//! definition somebody needs to be paged about it.
//!
//! The actual emission goes through the `log` facade so that the process can
//! direct output wherever the deployment wants.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// Log severities, ordered `Debug < Info < Error < Disaster`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Error,
    Disaster,
}

impl Severity {
    fn level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            // `log` has no level more severe than Error; Disaster is
            // distinguished by the direct stderr write.
            Severity::Error | Severity::Disaster => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Severity::Debug => write!(f, "debug"),
            Severity::Info => write!(f, "info"),
            Severity::Error => write!(f, "error"),
            Severity::Disaster => write!(f, "disaster"),
        }
    }
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "error" => Ok(Severity::Error),
            "disaster" => Ok(Severity::Disaster),
            _ => Err(()),
        }
    }
}

/// A buffer of log lines belonging to one tagged request.
///
/// Nothing is emitted until `commit()`; the one exception is `Disaster`,
/// which is emitted (and written to stderr) the moment it is logged.
#[derive(Default)]
pub struct RequestLog {
    lines: Vec<(Severity, String)>,
    failed: bool,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, severity: Severity, line: String) {
        if Severity::Disaster == severity {
            emit_disaster(&line);
            return;
        }

        if severity >= Severity::Error {
            self.failed = true;
        }

        self.lines.push((severity, line));
    }

    /// Marks the request as failed, so that `commit()` flushes `Debug` lines
    /// too.
    pub fn set_failed(&mut self) {
        self.failed = true;
    }

    /// Emits the buffered lines and clears the buffer.
    ///
    /// The buffer may be reused for the next request afterwards.
    pub fn commit(&mut self) {
        let keep_debug = self.failed;
        for (severity, line) in self.lines.drain(..) {
            if Severity::Debug == severity && !keep_debug {
                continue;
            }

            log::log!(severity.level(), "{}", line);
        }

        self.failed = false;
    }
}

fn emit_disaster(line: &str) {
    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "DISASTER: {}", line);
    let _ = stderr.flush();
    log::error!("DISASTER: {}", line);
}

/// Logs a disaster outside any request context.
pub fn disaster(line: &str) {
    emit_disaster(line);
}

/// Installs a minimal stderr logger honouring the configured severity floor.
pub fn init_stderr(floor: Severity) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(StderrLogger { floor }))?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

struct StderrLogger {
    floor: Severity,
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        let severity = match metadata.level() {
            log::Level::Trace | log::Level::Debug => Severity::Debug,
            log::Level::Info | log::Level::Warn => Severity::Info,
            log::Level::Error => Severity::Error,
        };
        severity >= self.floor
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        eprintln!("{} [{}] {}", now, record.level(), record.args());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Info < Severity::Error);
        assert!(Severity::Error < Severity::Disaster);
        assert_eq!(Ok(Severity::Disaster), "disaster".parse());
        assert_matches!(Err(()), "warn".parse::<Severity>());
    }

    #[test]
    fn successful_request_drops_debug() {
        let mut log = RequestLog::new();
        log.log(Severity::Debug, "noise".to_owned());
        log.log(Severity::Info, "useful".to_owned());
        assert!(!log.failed);
        log.commit();
        assert!(log.lines.is_empty());
    }

    #[test]
    fn failed_request_keeps_debug() {
        let mut log = RequestLog::new();
        log.log(Severity::Debug, "breadcrumb".to_owned());
        log.log(Severity::Error, "boom".to_owned());
        assert!(log.failed);
        log.commit();
        assert!(!log.failed);
    }
}
