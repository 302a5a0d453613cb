//! Local peer identity.
//!
//! Every process picks a fresh random identity at start-up.  Identities are
//! compared numerically during host election, so the 128 random bits of a
//! UUID v4 are folded into a non-negative `i64`.

use calib_core::PeerId;
use uuid::Uuid;

/// Generates a random, non-negative peer identity.
pub fn generate_peer_id() -> PeerId {
    fold_uuid(Uuid::new_v4())
}

fn fold_uuid(uuid: Uuid) -> PeerId {
    let bits = uuid.as_u128();
    let folded = (bits >> 64) as u64 ^ bits as u64;
    // Top bit cleared: the result always fits in a non-negative i64.
    PeerId((folded >> 1) as i64)
}
