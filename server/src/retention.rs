use std::time::Duration;

use dicebox_session::SessionDb;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodically purges roll records older than the retention age.
///
/// Runs outside per-request handling; a purge never removes a record younger
/// than the cutoff.
pub fn spawn_sweep(
    db: SessionDb,
    age: Duration,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    match dicebox_session::purge_older_than(&db, age).await {
                        Ok(0) => {}
                        Ok(purged) => {
                            log::debug!("Purged {purged} roll records older than {age:?}");
                        }
                        Err(error) => log::error!("Retention sweep failed: {error:?}"),
                    }
                }
            }
        }

        log::debug!("Stopped retention sweep");
    })
}
