//! Browser session lifecycle and security gating for the webpilot CLI.
//!
//! The pieces with real invariants live here: the sensitive-domain blocklist,
//! the port/PID/profile persistence shared between CLI invocations, the
//! session lifecycle manager that attaches to or launches Chrome over CDP,
//! and the command dispatcher that gates every verb through the blocklist.

pub mod blocklist;
pub mod cdp;
pub mod command;
pub mod engine;
pub mod persist;
pub mod session;

pub use blocklist::Blocklist;
pub use command::{CommandResult, Dispatcher};
pub use session::{Session, ShutdownReport};
