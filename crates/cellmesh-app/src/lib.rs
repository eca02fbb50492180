//! Scenario plumbing for the `cellmesh` binary.

pub mod command;
pub mod scenario;

pub use command::{
    CommandReceiver, CommandSender, CommandSubmit, ControlCommand, create_command_bus,
    drain_pending_commands, make_command_submit,
};
pub use scenario::{SCENARIO_SPACE, Scenario, ScenarioConfig, ScenarioSummary, ShutdownSummary};
