//! Light-client verification.
//!
//! A light client holds one trusted signed header and accepts new ones by
//! verification rather than by replaying consensus:
//!
//! - **Adjacent** (`height + 1`): the trusted header already names the next
//!   validator set hash, so it only needs to match and to have signed the
//!   new header with more than two thirds of its power.
//! - **Skipping** (`height + k`): the new validator set may be arbitrary,
//!   so acceptance additionally requires that validators of the *trusted*
//!   set holding at least `trust_level` of its power signed the new
//!   header. With less than a third of the old set Byzantine, at least one
//!   honest old validator vouches for the skip.
//!
//! A trusted header is only a usable anchor while its trusting period has
//! not elapsed; verification against an expired anchor fails regardless of
//! signatures.

mod verifier;

pub use verifier::{
    header_expired, validate_trust_level, verify, verify_adjacent, verify_backwards,
    verify_non_adjacent, LightError, Options,
};
