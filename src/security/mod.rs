//! Server-side admission gate and JWT validation (spec §4.7, §4.8).
//!
//! These are independent of [`crate::connection::Connection`] — they gate
//! inbound upgrades on whatever HTTP surface fronts a server, which is out
//! of this crate's scope (see SPEC_FULL.md §1 non-goals).

pub mod admission;
pub mod jwt;

pub use admission::{
    AdmissionConfig, AdmissionManager, AdmissionStats, OriginPolicy, SecuredConnection, TlsPolicy,
    UpgradeRequest,
};
pub use jwt::{AuthContext, JwtValidator, SigningMethod};
