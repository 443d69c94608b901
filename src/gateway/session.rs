//! L2 — Gateway Session. §2, §4 (implicit), §5 "Join requests have no
//! hard timeout but the outer service exits a per-attempt backoff of
//! up to 5 minutes; capped exponential."
//!
//! `serenity::Client::start()` already maintains the gateway
//! connection and resumes sessions on its own; what it does *not* do
//! is retry after it gives up and returns an error (a fatal gateway
//! close code, or the process losing network entirely). This wraps
//! that outer retry in the capped exponential backoff the spec
//! describes, the same reconnect-loop shape `Duocast-TSOD/client/src/
//! main.rs` wraps around its own connection attempt.

use std::time::Duration;

use serenity::Client;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Runs `client.start()` forever, reconnecting with capped exponential
/// backoff whenever it returns. A successful connection that stays up
/// for at least one backoff window resets the delay back to
/// `INITIAL_BACKOFF`, so a single outage never leaves the bot with a
/// five-minute retry delay for the rest of its life.
pub async fn run_forever(mut client: Client) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let started_at = tokio::time::Instant::now();
        if let Err(why) = client.start().await {
            tracing::error!(error = %why, "gateway session ended, reconnecting");
        } else {
            tracing::info!("gateway session ended cleanly");
        }

        if started_at.elapsed() >= backoff {
            backoff = INITIAL_BACKOFF;
        }

        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
        tracing::info!(delay_secs = backoff.as_secs(), "waiting before reconnect attempt");
        tokio::time::sleep(backoff + jitter).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_five_minutes() {
        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..20 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }
}
