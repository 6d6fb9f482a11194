//! Wallpaper pipeline orchestration and the daily scheduler.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeDelta, TimeZone};
use daywall_adapters::{
    SourceResolver, DEFAULT_IMAGE_SUFFIX, DEFAULT_LINK_SELECTOR, DEFAULT_LISTING_URL,
};
use daywall_core::{
    outcome_notification, ApplyError, Notifier, PipelineError, PipelineResult, RunTrigger,
    UiEvent, WallpaperApplier,
};
use daywall_storage::{
    write_atomically, DownloadArtifact, FetchError, HttpClientConfig, HttpFetcher, MarkerStore,
};
use image::{DynamicImage, ImageFormat};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "daywall-sync";

pub const APP_DIR_NAME: &str = "daywall";
pub const MARKER_FILE_NAME: &str = "last_update.txt";
pub const WALLPAPER_FILE_NAME: &str = "wallpaper.bmp";
pub const DEFAULT_UI_PORT: u16 = 8466;
pub const TRIGGER_HOUR: u32 = 9;
pub const TRIGGER_MINUTE: u32 = 0;

/// Longest single sleep before the wall clock is consulted again.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct DaywallConfig {
    pub listing_url: String,
    pub link_selector: String,
    pub image_suffix: String,
    pub trigger_at: NaiveTime,
    pub app_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub ui_port: u16,
}

impl Default for DaywallConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            link_selector: DEFAULT_LINK_SELECTOR.to_string(),
            image_suffix: DEFAULT_IMAGE_SUFFIX.to_string(),
            trigger_at: NaiveTime::from_hms_opt(TRIGGER_HOUR, TRIGGER_MINUTE, 0).unwrap_or_default(),
            app_dir: default_app_dir(),
            scratch_dir: std::env::temp_dir(),
            user_agent: format!("daywall/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            ui_port: DEFAULT_UI_PORT,
        }
    }
}

fn default_app_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR_NAME))
}

/// A zero timeout would fail every request, so it counts as unset.
fn positive_secs(raw: Option<String>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
}

impl DaywallConfig {
    /// Directory, port and timeout come from the environment; the source and
    /// schedule stay fixed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            app_dir: std::env::var_os("DAYWALL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.app_dir.clone()),
            scratch_dir: std::env::var_os("DAYWALL_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir.clone()),
            http_timeout_secs: positive_secs(std::env::var("DAYWALL_HTTP_TIMEOUT_SECS").ok())
                .unwrap_or(defaults.http_timeout_secs),
            ui_port: std::env::var("DAYWALL_UI_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ui_port),
            ..defaults
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.app_dir.join(MARKER_FILE_NAME)
    }

    pub fn wallpaper_path(&self) -> PathBuf {
        self.app_dir.join(WALLPAPER_FILE_NAME)
    }

    pub fn marker_store(&self) -> MarkerStore {
        MarkerStore::new(self.marker_path())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.app_dir, &self.scratch_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Anything the scheduler and the UI bridge can start.
#[async_trait]
pub trait PipelineJob: Send + Sync {
    async fn run(&self, trigger: RunTrigger) -> PipelineResult;
}

pub struct PipelineRunner {
    config: DaywallConfig,
    http: HttpFetcher,
    resolver: SourceResolver,
    marker: MarkerStore,
    applier: Arc<dyn WallpaperApplier>,
}

impl PipelineRunner {
    pub fn new(config: DaywallConfig, applier: Arc<dyn WallpaperApplier>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let resolver = SourceResolver::new(
            config.listing_url.clone(),
            config.link_selector.clone(),
            config.image_suffix.clone(),
        );
        let marker = config.marker_store();
        Ok(Self {
            config,
            http,
            resolver,
            marker,
            applier,
        })
    }

    pub fn config(&self) -> &DaywallConfig {
        &self.config
    }

    /// resolve → download → transcode → apply → mark, stopping at the first failure.
    pub async fn run_once(&self, trigger: RunTrigger) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, %trigger);
        async {
            info!("wallpaper pipeline started");
            let result = self.execute().await;
            match &result {
                Ok(()) => info!("wallpaper pipeline finished"),
                Err(err) => warn!(kind = err.kind().as_str(), error = %err, "wallpaper pipeline failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self) -> PipelineResult {
        let download_url = self.resolver.resolve_download_url(&self.http).await?;

        let artifact = DownloadArtifact::create_in(&self.config.scratch_dir)
            .await
            .map_err(|e| PipelineError::Io(format!("{e:#}")))?;
        let mut writer = artifact
            .writer()
            .map_err(|e| PipelineError::Io(format!("opening download artifact: {e}")))?;
        let bytes = self
            .http
            .download_into(&download_url, &mut writer)
            .await
            .map_err(download_failure)?;
        drop(writer);
        debug!(bytes, artifact = %artifact.path().display(), "image downloaded");

        let raw = artifact
            .read_all()
            .await
            .map_err(|e| PipelineError::Io(format!("reading download artifact: {e}")))?;
        let encoded = tokio::task::spawn_blocking(move || transcode_to_bmp(&raw))
            .await
            .map_err(|e| PipelineError::Io(format!("transcode task failed: {e}")))??;
        drop(artifact);

        let wallpaper_path = self.config.wallpaper_path();
        write_atomically(&wallpaper_path, &encoded)
            .await
            .map_err(|e| PipelineError::Io(format!("{e:#}")))?;

        self.applier
            .apply(&wallpaper_path)
            .await
            .map_err(|e| PipelineError::Apply(e.to_string()))?;

        if let Err(err) = self.marker.mark_updated_now().await {
            warn!(error = %format!("{err:#}"), "wallpaper applied but update marker not written");
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineJob for PipelineRunner {
    async fn run(&self, trigger: RunTrigger) -> PipelineResult {
        self.run_once(trigger).await
    }
}

fn download_failure(err: FetchError) -> PipelineError {
    match err {
        FetchError::Io(e) => PipelineError::Io(format!("writing download artifact: {e}")),
        other => PipelineError::Download(other.to_string()),
    }
}

/// Decode PNG/JPEG/GIF/BMP bytes and re-encode as a 24-bit BMP.
pub fn transcode_to_bmp(bytes: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))?;
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Bmp)
        .map_err(|e| PipelineError::Io(format!("encoding bmp: {e}")))?;
    Ok(out.into_inner())
}

pub fn report_outcome(notifier: &dyn Notifier, trigger: RunTrigger, result: &PipelineResult) {
    let (title, message) = outcome_notification(result);
    debug!(%trigger, title, "reporting run outcome");
    notifier.notify(title, &message);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!(title, message, "notification");
    }
}

/// Run `job` on its own task and report its outcome. The run completes even
/// if nobody awaits the handle.
pub fn spawn_pipeline_run(
    job: Arc<dyn PipelineJob>,
    notifier: Arc<dyn Notifier>,
    trigger: RunTrigger,
) -> JoinHandle<PipelineResult> {
    tokio::spawn(async move {
        let result = job.run(trigger).await;
        report_outcome(notifier.as_ref(), trigger, &result);
        result
    })
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// The first `at` strictly after `now`. Days where `at` does not exist
/// locally (DST gap) are skipped.
pub fn next_trigger<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    for day in now.date_naive().iter_days().take(3) {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
    }
    now.clone() + TimeDelta::days(1)
}

pub struct Scheduler {
    job: Arc<dyn PipelineJob>,
    marker: MarkerStore,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    trigger_at: NaiveTime,
}

impl Scheduler {
    pub fn new(
        job: Arc<dyn PipelineJob>,
        marker: MarkerStore,
        notifier: Arc<dyn Notifier>,
        trigger_at: NaiveTime,
    ) -> Self {
        Self {
            job,
            marker,
            notifier,
            clock: Arc::new(SystemClock),
            trigger_at,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Startup check: run once now if today's slot has passed without a
    /// successful update. Returns whether a run happened.
    pub async fn catch_up(&self) -> bool {
        let now = self.clock.now();
        if now.time() < self.trigger_at {
            debug!(trigger_at = %self.trigger_at, "today's slot not reached yet");
            return false;
        }
        if self.marker.was_updated_on(now.date_naive()).await {
            info!(day = %now.date_naive(), "wallpaper already updated today");
            return false;
        }
        info!("today's slot was missed, running catch-up");
        let _ = self.run_slot(RunTrigger::Startup).await;
        true
    }

    async fn run_slot(&self, trigger: RunTrigger) -> PipelineResult {
        let handle = spawn_pipeline_run(Arc::clone(&self.job), Arc::clone(&self.notifier), trigger);
        match handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(%trigger, error = %err, "pipeline task did not complete");
                Err(PipelineError::Io(format!("pipeline task did not complete: {err}")))
            }
        }
    }

    /// Catch-up, then one run per daily slot until `cancel` fires. A run in
    /// progress is never interrupted.
    pub async fn run(self, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        info!(trigger_at = %self.trigger_at, "scheduler started");
        self.catch_up().await;

        let mut last_slot: Option<DateTime<Local>> = None;
        loop {
            let now = self.clock.now();
            let reference = match last_slot {
                Some(prev) if prev > now => prev,
                _ => now,
            };
            let slot = next_trigger(&reference, self.trigger_at);
            info!(next = %slot, "waiting for next wallpaper slot");

            if !self.wait_until(slot, &cancel).await {
                info!("scheduler stopped");
                return;
            }
            last_slot = Some(slot);

            if self.marker.was_updated_on(slot.date_naive()).await {
                info!(day = %slot.date_naive(), "wallpaper already updated today, skipping slot");
                continue;
            }
            let _ = self.run_slot(RunTrigger::Scheduled).await;
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Returns false when cancelled before the wall clock reaches `slot`.
    async fn wait_until(&self, slot: DateTime<Local>, cancel: &CancellationToken) -> bool {
        loop {
            let now = self.clock.now();
            if now >= slot {
                return true;
            }
            let remaining = (slot - now)
                .to_std()
                .unwrap_or_default()
                .min(MAX_WAIT_SLICE);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

/// Dispatch presentation-layer events until exit is requested or the
/// channel closes. Each force request becomes an independent run.
pub async fn drive_ui_events(
    mut events: mpsc::UnboundedReceiver<UiEvent>,
    job: Arc<dyn PipelineJob>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(UiEvent::ForceRequested) => {
                info!("forced wallpaper update requested");
                let _ = spawn_pipeline_run(Arc::clone(&job), Arc::clone(&notifier), RunTrigger::Forced);
            }
            Some(UiEvent::ExitRequested) => {
                info!("exit requested");
                cancel.cancel();
                return;
            }
            None => {
                debug!("ui event channel closed");
                cancel.cancel();
                return;
            }
        }
    }
}

struct ApplyCommand {
    program: &'static str,
    args: Vec<String>,
    required: bool,
}

impl ApplyCommand {
    fn new(program: &'static str, args: Vec<String>, required: bool) -> Self {
        Self {
            program,
            args,
            required,
        }
    }
}

/// Sets the desktop background through the platform's own tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallpaperApplier;

#[async_trait]
impl WallpaperApplier for SystemWallpaperApplier {
    async fn apply(&self, path: &Path) -> Result<(), ApplyError> {
        let absolute = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| ApplyError(format!("resolving {}: {e}", path.display())))?;
        for command in platform_commands(&absolute)? {
            let output = tokio::process::Command::new(command.program)
                .args(&command.args)
                .output()
                .await;
            let failure = match output {
                Ok(output) if output.status.success() => None,
                Ok(output) => Some(format!(
                    "{} exited with {}: {}",
                    command.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
                Err(err) => Some(format!("running {}: {err}", command.program)),
            };
            match failure {
                Some(reason) if command.required => return Err(ApplyError(reason)),
                Some(reason) => debug!(%reason, "optional wallpaper command failed"),
                None => {}
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "windows")]
fn platform_commands(path: &Path) -> Result<Vec<ApplyCommand>, ApplyError> {
    let shown = path.to_string_lossy();
    let plain = shown.strip_prefix(r"\\?\").unwrap_or(&shown);
    let literal = plain.replace('\'', "''");
    // SPI_SETDESKWALLPAPER = 20, SPIF_UPDATEINIFILE | SPIF_SENDWININICHANGE = 3
    let script = format!(
        "Add-Type -TypeDefinition @'\n\
         using System.Runtime.InteropServices;\n\
         public static class DaywallNative {{\n\
         [DllImport(\"user32.dll\", CharSet = CharSet.Unicode, SetLastError = true)]\n\
         public static extern bool SystemParametersInfo(int action, int param, string value, int flags);\n\
         }}\n\
         '@\n\
         if (-not [DaywallNative]::SystemParametersInfo(20, 0, '{literal}', 3)) {{ exit 1 }}"
    );
    Ok(vec![ApplyCommand::new(
        "powershell",
        vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script,
        ],
        true,
    )])
}

#[cfg(target_os = "macos")]
fn platform_commands(path: &Path) -> Result<Vec<ApplyCommand>, ApplyError> {
    let quoted = path
        .to_string_lossy()
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    let script = format!(
        "tell application \"System Events\" to tell every desktop to set picture to \"{quoted}\""
    );
    Ok(vec![ApplyCommand::new(
        "osascript",
        vec!["-e".to_string(), script],
        true,
    )])
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn platform_commands(path: &Path) -> Result<Vec<ApplyCommand>, ApplyError> {
    let uri = url::Url::from_file_path(path)
        .map_err(|_| ApplyError(format!("{} is not an absolute path", path.display())))?
        .to_string();
    let gsettings = |key: &str| {
        vec![
            "set".to_string(),
            "org.gnome.desktop.background".to_string(),
            key.to_string(),
            uri.clone(),
        ]
    };
    Ok(vec![
        ApplyCommand::new("gsettings", gsettings("picture-uri"), true),
        // Only present on GNOME 42+.
        ApplyCommand::new("gsettings", gsettings("picture-uri-dark"), false),
    ])
}
