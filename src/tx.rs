use crate::{channel::Channel, Result};
use tracing::error;

/// Scoped AMQP transaction.
///
/// [`select`](Tx::select) puts the channel in transactional mode and opens
/// the first transaction; publishes and acks issued on the channel are
/// then staged until [`commit`](Tx::commit). Dropping the guard without
/// committing rolls the staged work back.
#[must_use = "dropping a Tx rolls the transaction back"]
pub struct Tx {
    channel: Channel,
    completed: bool,
}

impl Tx {
    pub fn select(channel: &Channel) -> Result<Tx> {
        channel.tx_select()?;
        Ok(Tx {
            channel: channel.clone(),
            completed: false,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.completed = true;
        self.channel.tx_commit()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.completed = true;
        self.channel.tx_rollback()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !self.completed && self.channel.status().connected() {
            if let Err(err) = self.channel.tx_rollback() {
                error!(
                    "error rolling back dropped transaction on channel {}: {}",
                    self.channel.id(),
                    err
                );
            }
        }
    }
}
