//! Desired-state diffing.
//!
//! The previously reconciled snapshot is compared field-by-field against
//! the incoming record; the supervisor's decision table consumes the
//! resulting flags. The snapshot is passed in explicitly — there is no
//! module-level "previous config" anywhere.

use courier_config::AccountDesiredState;

/// What changed between two reconciliations of one account.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountDiff {
    pub token_changed: bool,
    pub kind_changed: bool,
    pub routes_changed: bool,
    pub translation_changed: bool,
    pub filters_changed: bool,
    /// The restart nonce moved.
    pub restart_requested: bool,
    /// Login was requested: either freshly toggled on, or re-requested
    /// via a bumped login nonce.
    pub login_became_true: bool,
    pub login_became_false: bool,
}

impl AccountDiff {
    #[must_use]
    pub fn between(prev: &AccountDesiredState, next: &AccountDesiredState) -> Self {
        Self {
            token_changed: !prev.token_matches(next),
            kind_changed: prev.session_kind != next.session_kind || prev.proxy != next.proxy,
            routes_changed: prev.routes != next.routes,
            translation_changed: prev.translation != next.translation
                || prev.forward != next.forward,
            filters_changed: prev.filters != next.filters
                || prev.reply_scan != next.reply_scan
                || prev.replacements != next.replacements
                || prev.impersonate != next.impersonate,
            restart_requested: prev.restart_nonce != next.restart_nonce,
            login_became_true: next.login_requested
                && (!prev.login_requested || prev.login_nonce != next.login_nonce),
            login_became_false: prev.login_requested && !next.login_requested,
        }
    }

    /// Changes that require tearing the session down.
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        self.token_changed || self.kind_changed || self.restart_requested || self.login_became_true
    }

    /// Changes a running session can absorb in place.
    #[must_use]
    pub fn hot_updatable(&self) -> bool {
        self.routes_changed || self.translation_changed || self.filters_changed
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.requires_restart()
            && !self.hot_updatable()
            && !self.login_became_false
    }
}
