//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Runtime helpers supporting the control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
//! Timer and scheduling helpers for the R-BMS runtime.
//!
//! Protection logic never sleeps. Deferred work is expressed as a
//! [`OneShotTimer`] that is armed against an explicit `now` and fired by the
//! owner's `poll(now)`; the async loop only paces those polls with a
//! [`RateLimiter`].

pub mod scheduling;
pub mod timer;

pub use scheduling::RateLimiter;
pub use timer::OneShotTimer;
