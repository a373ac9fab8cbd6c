use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const STOP_WORDS: [&str; 3] = ["stop", "quit", "end"];

pub fn is_stop_command(line: &str) -> bool {
    let word = line.trim();
    STOP_WORDS.iter().any(|w| word.eq_ignore_ascii_case(w))
}

/// Resolves when an operator types a stop word on stdin. Without a usable
/// stdin (closed, detached) it never resolves and Ctrl-C remains the way out.
pub async fn wait_for_stop() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stop_command(&line) => {
                info!(command = line.trim(), "console stop requested");
                return;
            }
            Ok(Some(line)) if !line.trim().is_empty() => {
                warn!("unknown command {:?}; try stop, quit or end", line.trim());
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!("console: {}", e);
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words() {
        assert!(is_stop_command("stop"));
        assert!(is_stop_command("  QUIT\n"));
        assert!(is_stop_command("end"));
        assert!(!is_stop_command("stopp"));
        assert!(!is_stop_command(""));
    }
}
