use cellmesh_core::{EntityId, ProcessAddr, SpaceId, Vec3};
use crossfire::mpmc;
use crossfire::{MAsyncTx, MRx, TryRecvError, TrySendError, detect_backoff_cfg};
use std::sync::Arc;
use tracing::warn;

/// Operator requests applied between cluster ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Kill a process and hand its cells to a neighbour.
    KillPeer(ProcessAddr),
    Teleport {
        entity: EntityId,
        space: SpaceId,
        position: Vec3,
    },
    /// Start a controlled shutdown on every process.
    Shutdown,
}

pub type CommandSender = MAsyncTx<ControlCommand>;
pub type CommandReceiver = MRx<ControlCommand>;
pub type CommandSubmit = Arc<dyn Fn(ControlCommand) -> bool + Send + Sync>;

pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity)
}

/// Everything queued right now, in submission order.
pub fn drain_pending_commands(receiver: &CommandReceiver) -> Vec<ControlCommand> {
    let mut commands = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(command) => commands.push(command),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    commands
}

pub fn make_command_submit(sender: CommandSender) -> CommandSubmit {
    let sender = Arc::new(sender);
    Arc::new(
        move |command: ControlCommand| match sender.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(cmd)) => {
                warn!(?cmd, "control command queue full; dropping command");
                false
            }
            Err(TrySendError::Disconnected(cmd)) => {
                warn!(?cmd, "control command queue disconnected");
                false
            }
        },
    )
}
