//! Floorcast Environment Abstraction Layer
//!
//! This crate lets the Floorcast engines run against either the **real**
//! clock (tokio) or a **virtual** clock driven by the simulation harness.
//!
//! # Core Concept
//!
//! Every engine touches the outside world through three things only:
//! - Time (`now()`, `sleep()`)
//! - Background work (`spawn()`)
//! - Randomness (`seed()`, `derive_seed()`)
//!
//! Routing all of them through [`FloorContext`] means a day simulation or a
//! Monte Carlo trial can be replayed exactly from its seed.
//!
//! # Example
//!
//! ```ignore
//! use floorcast_env::FloorContext;
//!
//! async fn tick_loop<Ctx: FloorContext>(ctx: &Ctx, per_tick: Duration) {
//!     for minute in 1..1440 {
//!         advance(minute);
//!         ctx.sleep(per_tick).await;
//!     }
//! }
//! ```

mod context;
mod types;
mod error;
mod tokio_impl;

pub use context::FloorContext;
pub use types::{TaskId, WorkerId, ZoneId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
