//! ---
//! bms_section: "01-core-functionality"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Telemetry fan-out, supervisor and control loop."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
pub mod runtime;
pub mod source;
pub mod supervisor;
pub mod telemetry;

pub use runtime::{BmsRuntime, RuntimeHandle};
pub use source::{pump, JsonlReplaySource, TelemetrySource};
pub use supervisor::BmsSupervisor;
pub use telemetry::{FlowSet, TelemetryFrame};
