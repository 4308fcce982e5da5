//! mrgc-routing — routing score engine.
//!
//! [`scorer`] is a pure function from a node's queue depth, latency and
//! health to a 0–100 score. [`selector`] ranks the scored nodes of a
//! region and pool; [`RouteSelector`] runs that ranking over the facts
//! currently in the state store.

pub mod scorer;
pub mod selector;

pub use scorer::{ScoreBreakdown, ScoringWeights, routing_score, score_breakdown};
pub use selector::{RouteCandidate, RouteSelector, rank_candidates};
