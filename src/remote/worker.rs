use super::broker::{Luid, ReferenceTable};
use super::command::CommandArgs;
use super::RemoteError;
use async_trait::async_trait;
use std::sync::Arc;

/// Master-side view of a connected worker.
///
/// The transport behind it is expected to be a reliable, ordered RPC channel
/// that can call back into objects registered in [`WorkerConnection::broker`].
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// Worker name as recorded on builds
    fn name(&self) -> &str;

    /// Reference table for objects the worker may call back into
    fn broker(&self) -> Arc<ReferenceTable>;

    /// Ask the worker to start `command`, reporting back to `luid`
    async fn start_command(
        &self,
        luid: Luid,
        command: &str,
        args: &CommandArgs,
    ) -> Result<(), RemoteError>;

    /// Ask the worker to stop the command reporting to `luid`
    async fn interrupt_command(&self, luid: Luid, why: &str) -> Result<(), RemoteError>;
}
