//! Route gating: what a page should do given the current session state.

use crate::{
    controller::SessionController,
    state::{AuthErrorKind, SessionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Show a neutral loading indicator and nothing else.
    Loading,
    /// Show the blocking "not registered" view.
    NotRegistered,
    /// Render nothing and send the user to the login page.
    RedirectToLogin,
    Render,
}

pub fn decide(state: &SessionState) -> RouteDecision {
    if state.is_loading() {
        return RouteDecision::Loading;
    }
    let not_registered = state
        .auth_error
        .as_ref()
        .is_some_and(|err| err.kind == AuthErrorKind::UserNotRegistered);
    if not_registered {
        RouteDecision::NotRegistered
    } else if !state.is_authenticated() {
        RouteDecision::RedirectToLogin
    } else {
        RouteDecision::Render
    }
}

/// Tracks the last decision so the login redirect fires once per
/// transition rather than on every evaluation.
#[derive(Debug, Default)]
pub struct RouteGate {
    last: Option<RouteDecision>,
}

impl RouteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&mut self, controller: &SessionController) -> RouteDecision {
        let decision = decide(&controller.snapshot());
        if decision == RouteDecision::RedirectToLogin
            && self.last != Some(RouteDecision::RedirectToLogin)
        {
            controller.navigate_to_login();
        }
        self.last = Some(decision);
        decision
    }
}

#[cfg(test)]
#[path = "tests/gate_tests.rs"]
mod tests;
