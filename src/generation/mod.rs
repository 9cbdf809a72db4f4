//! Generation flow for a single prompt submission.
//!
//! ```text
//!   Idle ──submit──▶ Generating ──ok──▶ Complete
//!     ▲                  │                 │
//!     │                  └──err/timeout──▶ Error
//!     └────────────── reset ◀──────────────┘
//! ```

mod controller;

pub use controller::{
    AnimationBackend, GenerationController, GenerationState, GenerationStatus, SubmitOutcome,
    SubmitRejection,
};
