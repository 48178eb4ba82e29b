//! Protocol relay: the per-client session state machine and the listening
//! acceptor that admission-controls and spawns sessions.

mod acceptor;
mod session;

pub use acceptor::{run_acceptor, AcceptorConfig};
pub use session::{run_session, SessionConfig};
