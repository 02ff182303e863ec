//! gh-ost style online schema changes.
//!
//! An online schema change runs as two tasks linked by `depends_on`:
//!
//! ```text
//!  GHOST_SYNC                          GHOST_CUTOVER
//!  ──────────                          ─────────────
//!  create postpone flag file
//!  start row copier ───────┐
//!  poll progress           │ copier copies chunks,
//!  observe postpone ───────┤ replays DML, then holds
//!  publish handoff         │ at the postpone point
//!  return DONE             │
//!                          │           take handoff
//!                          │           wait for lag gate
//!                          │           remove flag file ──> copier does final
//!                          └─────────> catch-up + atomic rename, exits
//!                                      refresh schema snapshot
//!                                      sweep shadow tables
//! ```
//!
//! The handoff between the two phases is process-local (see
//! [`GhostHandoffMap`]); schedulers therefore dispatch a cutover task only in
//! the process whose sync task produced the handoff.

mod config;
mod cutover;
mod handoff;
mod migration;
mod sync;

pub use config::GhostConfig;
pub use cutover::GhostCutoverExecutor;
pub use handoff::{GhostHandoff, GhostHandoffMap};
pub use migration::{MigrationHandle, RowCopier, SimulatedRowCopier};
pub use sync::GhostSyncExecutor;

/// Extracts the target table name from a DDL statement, skipping directive
/// comment lines. Returns `None` if no `TABLE <name>` clause is found.
#[must_use]
pub fn table_name_from_statement(statement: &str) -> Option<String> {
    let mut tokens = statement
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .flat_map(str::split_whitespace);

    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("table") {
            let name = tokens.next()?;
            let name = name.trim_matches(|c: char| c == '`' || c == '"' || c == ';' || c == '(');
            // Strip a schema qualifier if present.
            let name = name.rsplit('.').next().unwrap_or(name);
            let name = name.trim_matches('`');
            if name.is_empty() {
                return None;
            }
            return Some(name.to_owned());
        }
    }
    None
}
