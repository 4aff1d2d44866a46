//! bramble-lib: a hermetic, content-addressed build engine.
//!
//! - `Derivation`: a build recipe, named by the hash of its canonical JSON
//! - `Store`: the padded store directory holding derivations and outputs
//! - `normalize`: turns a build's output directory into a location
//!   independent archive and names it by content hash
//! - `Builder`: runs derivations in a sandbox with early cutoff
//! - `cache`: moves derivations and outputs to and from remote caches

pub mod builder;
pub mod cache;
pub mod consts;
pub mod derivation;
pub mod graph;
pub mod jobs;
pub mod lockfile;
pub mod normalize;
pub mod sandbox;
pub mod store;
pub mod util;
