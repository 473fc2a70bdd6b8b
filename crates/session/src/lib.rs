pub mod controller;
pub mod gate;
pub mod state;

pub use controller::{ActionOutcome, Navigation, SessionController, SIGN_UP_PENDING_MESSAGE};
pub use gate::{decide, RouteDecision, RouteGate};
pub use state::{AuthError, AuthErrorKind, SessionInput, SessionPhase, SessionState};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
