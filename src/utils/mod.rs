/// Utility functions and helpers
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
}

/// Exponential backoff delay with random jitter.
///
/// The delay doubles per attempt starting from `base`, capped at `cap`,
/// with up to 50% random jitter added so concurrent retriers spread out.
pub fn jittered_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
    let capped = exp.min(cap);
    let jitter_ms = if capped.as_millis() == 0 {
        0
    } else {
        rand::random::<u64>() % (capped.as_millis() as u64 / 2 + 1)
    };
    capped + Duration::from_millis(jitter_ms)
}

/// Split a `host[:port]` string, applying `default_port` when no port is given.
pub fn parse_host_port(address: &str, default_port: u16) -> Result<(String, u16), String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err("address cannot be empty".to_string());
    }

    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(format!("missing host in address: {}", address));
            }
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port in address: {}", address))?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), default_port)),
    }
}
