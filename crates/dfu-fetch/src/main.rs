mod sink;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use tracing::{info, warn};

use dfu_client::{DfuConfig, DfuResult, DownloadEvent, EventHandler, Progress, Session};

use crate::sink::FirmwareSink;

/// Settings for one fetch run, read from `DFU_*` environment variables.
#[derive(Debug, Clone)]
struct FetchConfig {
    host: String,
    resource: String,
    output: PathBuf,
    expected_sha256: Option<String>,
    max_retries: u32,
    timeout: Duration,
    poll_interval: Duration,
}

impl FetchConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("DFU_HOST").context("DFU_HOST is required")?;
        let resource = lookup("DFU_RESOURCE").context("DFU_RESOURCE is required")?;
        let output = lookup("DFU_OUTPUT").unwrap_or_else(|| "firmware.bin".into());
        let expected_sha256 = lookup("DFU_EXPECTED_SHA256")
            .map(|digest| digest.trim().to_ascii_lowercase())
            .filter(|digest| !digest.is_empty());
        let max_retries: u32 = lookup("DFU_MAX_RETRIES")
            .unwrap_or_else(|| "3".into())
            .parse()
            .context("DFU_MAX_RETRIES")?;
        let timeout_secs: u64 = lookup("DFU_TIMEOUT_SECS")
            .unwrap_or_else(|| "300".into())
            .parse()
            .context("DFU_TIMEOUT_SECS")?;
        let poll_ms: u64 = lookup("DFU_POLL_INTERVAL_MS")
            .unwrap_or_else(|| "5".into())
            .parse()
            .context("DFU_POLL_INTERVAL_MS")?;

        Ok(Self {
            host,
            resource,
            output: PathBuf::from(output),
            expected_sha256,
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_millis(poll_ms),
        })
    }
}

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dfu_fetch=info,dfu_client=info".into()),
        )
        .init();

    // Config
    let fetch = FetchConfig::from_env()?;
    let dfu = DfuConfig::from_env()?;

    let (sink, resume) = FirmwareSink::open(&fetch.output)?;
    let sink = Arc::new(Mutex::new(sink));

    let mut session = Session::new(
        fetch.host.clone(),
        fetch.resource.clone(),
        sink_handler(sink.clone()),
        dfu,
    )?;
    session.resume_from(resume)?;

    info!(
        host = %session.host(),
        port = session.config().port,
        resource = %session.resource(),
        output = %fetch.output.display(),
        fragment = session.config().max_fragment_size,
        offset = resume,
        "starting firmware download"
    );

    let started = Instant::now();
    download(&mut session, &sink, &fetch)?;
    session.disconnect();

    let size = session.downloaded_bytes();
    let elapsed = started.elapsed();
    info!(
        bytes = size,
        elapsed_ms = elapsed.as_millis() as u64,
        "download complete"
    );

    let mut sink = sink.lock().map_err(|_| anyhow!("output sink poisoned"))?;
    if let Some(expected) = &fetch.expected_sha256 {
        let actual = sink.sha256()?;
        if actual != *expected {
            sink.clear_offset()?;
            bail!("SHA-256 mismatch: expected {}, got {}", expected, actual);
        }
        info!(sha256 = %actual, "checksum verified");
    }
    sink.clear_offset()?;

    Ok(())
}

/// Route engine events into the output file.
fn sink_handler(sink: Arc<Mutex<FirmwareSink>>) -> EventHandler {
    Box::new(move |event| {
        let mut sink = sink.lock().map_err(|_| anyhow!("output sink poisoned"))?;
        match event {
            DownloadEvent::Fragment { offset, data, .. } => sink.write_fragment(offset, data),
            DownloadEvent::Complete { firmware_size } => sink.finish(firmware_size),
            DownloadEvent::Error(e) => {
                sink.fatal = e.is_fatal();
                sink.last_error = Some(e.to_string());
                Ok(())
            }
        }
    })
}

/// Drive the session to completion, restarting after failures.
fn download(
    session: &mut Session,
    sink: &Arc<Mutex<FirmwareSink>>,
    fetch: &FetchConfig,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + fetch.timeout;
    let mut attempt = 0;

    restart_with_retries(session, fetch, &mut attempt)?;

    loop {
        if Instant::now() >= deadline {
            bail!(
                "timed out after {}s at {} bytes",
                fetch.timeout.as_secs(),
                session.downloaded_bytes()
            );
        }

        match session.advance()? {
            Progress::Pending => thread::sleep(fetch.poll_interval),
            Progress::Fragment { .. } | Progress::Retrying => {}
            Progress::Complete => return Ok(()),
            Progress::Halted => bail!("download halted at {} bytes", session.downloaded_bytes()),
            Progress::Failed => {
                let (message, fatal) = {
                    let mut sink = sink.lock().map_err(|_| anyhow!("output sink poisoned"))?;
                    let failure = sink.take_failure();
                    if failure.1 {
                        // The partial file belongs to another image.
                        sink.clear_offset()?;
                    }
                    failure
                };
                attempt += 1;
                if fatal || attempt > fetch.max_retries {
                    bail!("download failed at {} bytes: {}", session.downloaded_bytes(), message);
                }
                warn!(
                    attempt,
                    offset = session.downloaded_bytes(),
                    error = %message,
                    "download interrupted, resuming"
                );
                thread::sleep(backoff(attempt));
                restart_with_retries(session, fetch, &mut attempt)?;
            }
        }
    }
}

/// Restart until it succeeds or the retry budget shared with the polling
/// loop runs out.
fn restart_with_retries(
    session: &mut Session,
    fetch: &FetchConfig,
    attempt: &mut u32,
) -> anyhow::Result<()> {
    loop {
        match restart(session) {
            Ok(()) => return Ok(()),
            Err(e) => {
                *attempt += 1;
                if !e.is_retryable() || *attempt > fetch.max_retries {
                    return Err(e).context("could not start download");
                }
                warn!(attempt = *attempt, error = %e, "connect failed, retrying");
                thread::sleep(backoff(*attempt));
            }
        }
    }
}

/// Reconnect and request the fragment at the current offset.
fn restart(session: &mut Session) -> DfuResult<()> {
    session.disconnect();
    session.connect()?;
    session.start_download()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * u64::from(attempt.min(10)))
}
