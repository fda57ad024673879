//! Stochastic packet loss models for in-the-wild testing.
//!
//! Loss is applied on the receive path only: a dropped datagram is one the
//! carrier read from the socket and then discarded before parsing.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Loss model construction errors
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum LossError {
    /// A Markov parameter lies outside `[0, 1]`
    #[error("loss probability {0} is outside [0, 1]")]
    OutOfRange(f32),
}

/// Decides per received datagram whether to drop it
pub trait LossModel: Send {
    /// Draw once; true means the datagram is discarded.
    fn should_drop(&mut self) -> bool;
}

/// Pass-through model that never drops
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoss;

impl LossModel for NoLoss {
    fn should_drop(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Received,
    Lost,
}

/// Two-state Markov (Gilbert) loss model.
///
/// From `Received`, a draw `x < p` moves to `Lost`; from `Lost`, a draw
/// `x ≥ 1 − q` moves back to `Received`. A datagram is dropped iff the
/// chain is in `Lost` after the draw.
#[derive(Debug)]
pub struct MarkovLoss {
    p: f32,
    q: f32,
    state: LinkState,
    rng: StdRng,
}

impl MarkovLoss {
    /// Create a model with entropy-seeded randomness.
    ///
    /// # Errors
    ///
    /// Returns [`LossError::OutOfRange`] unless both `p` and `q` lie in
    /// `[0, 1]`.
    pub fn new(p: f32, q: f32) -> Result<Self, LossError> {
        Self::with_rng(p, q, StdRng::from_entropy())
    }

    /// Create a deterministically seeded model, for reproducible tests.
    ///
    /// # Errors
    ///
    /// Returns [`LossError::OutOfRange`] unless both `p` and `q` lie in
    /// `[0, 1]`.
    pub fn with_seed(p: f32, q: f32, seed: u64) -> Result<Self, LossError> {
        Self::with_rng(p, q, StdRng::seed_from_u64(seed))
    }

    fn with_rng(p: f32, q: f32, rng: StdRng) -> Result<Self, LossError> {
        for value in [p, q] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LossError::OutOfRange(value));
            }
        }
        Ok(Self {
            p,
            q,
            state: LinkState::Received,
            rng,
        })
    }
}

impl LossModel for MarkovLoss {
    fn should_drop(&mut self) -> bool {
        let x = self.rng.gen::<f32>();
        self.state = match self.state {
            LinkState::Received if x < self.p => LinkState::Lost,
            LinkState::Lost if x >= 1.0 - self.q => LinkState::Received,
            unchanged => unchanged,
        };
        self.state == LinkState::Lost
    }
}
