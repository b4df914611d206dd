//! Target network updates.
//!
//! Soft update (Polyak averaging), applied elementwise to every variable:
//!
//! ```text
//! θ_target = τ * θ_online + (1 - τ) * θ_target
//! ```

use tch::nn::VarStore;

/// Soft-updates every variable of `target` from the same-named variable of
/// `online`. Variables missing from `online` are left untouched.
pub fn soft_update_var_store(target: &mut VarStore, online: &VarStore, tau: f64) {
    let online_vars = online.variables();
    tch::no_grad(|| {
        for (name, mut var) in target.variables() {
            if let Some(src) = online_vars.get(&name) {
                let mixed = src * tau + &var * (1.0 - tau);
                var.copy_(&mixed);
            }
        }
    });
}

/// Copies every variable of `online` into `target`.
pub fn hard_update_var_store(target: &mut VarStore, online: &VarStore) -> Result<(), tch::TchError> {
    target.copy(online)
}
