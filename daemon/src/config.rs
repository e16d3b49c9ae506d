use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BRIDGE_COMMAND: &str = "alsa_in";
pub const DEFAULT_JACK_CLIENT_NAME: &str = "RTC_2";
pub const DEFAULT_ALSA_DEVICE: &str = "hw:Adapter_1";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u32 = 1;
pub const DEFAULT_LAUNCHER_PATH: &str =
    "/home/chris/.local/share/Steam/steamapps/common/rocksmith-launcher.sh";
pub const DEFAULT_GAME_PROCESS: &str = "Rocksmith2014";
pub const DEFAULT_AUDIO_CLIENT: &str = "Rocksmith2014";

/// Line emitted by `alsa_in` when the capture device wedges (EAGAIN). The
/// bridge keeps running but produces no audio, so it must not be left up.
pub const FATAL_BRIDGE_MARKER: &str = "err = -11";

/// Immutable session configuration, fixed for the lifetime of the run.
/// Deserialized from an optional config.toml; defaults reproduce the
/// hard-wired single-cable Rocksmith setup.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub game: GameConfig,
    /// (source port, destination port) pairs connected once the game's
    /// audio client registers. Order is preserved.
    #[serde(default = "default_connections")]
    pub connections: Vec<PortPair>,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            game: GameConfig::default(),
            connections: default_connections(),
            timing: TimingConfig::default(),
        }
    }
}

/// The `alsa_in` bridge that exposes the real-tone cable to JACK.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    /// JACK client name the bridge registers under (`-j`).
    #[serde(default = "default_jack_client_name")]
    pub jack_client_name: String,
    /// ALSA capture device (`-d`).
    #[serde(default = "default_alsa_device")]
    pub alsa_device: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
}

impl BridgeConfig {
    /// Argument vector for the bridge command.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-j".into(),
            self.jack_client_name.clone(),
            "-d".into(),
            self.alsa_device.clone(),
            "-r".into(),
            self.sample_rate.to_string(),
            "-c".into(),
            self.channels.to_string(),
        ]
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_BRIDGE_COMMAND.to_string(),
            jack_client_name: DEFAULT_JACK_CLIENT_NAME.to_string(),
            alsa_device: DEFAULT_ALSA_DEVICE.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// Launcher script started detached; the game itself is a grandchild
    /// we never own.
    #[serde(default = "default_launcher_path")]
    pub launcher_path: String,
    /// Substring matched against process names and command lines. Proton
    /// runs the game under wine-preloader, so the command line is the
    /// reliable place to find the exe name.
    #[serde(default = "default_game_process")]
    pub process_name: String,
    /// Substring matched against JACK client names on the bus.
    #[serde(default = "default_audio_client")]
    pub audio_client: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            launcher_path: DEFAULT_LAUNCHER_PATH.to_string(),
            process_name: DEFAULT_GAME_PROCESS.to_string(),
            audio_client: DEFAULT_AUDIO_CLIENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortPair {
    pub src: String,
    pub dst: String,
}

fn default_connections() -> Vec<PortPair> {
    vec![PortPair {
        src: format!("{DEFAULT_JACK_CLIENT_NAME}:capture_1"),
        dst: format!("{DEFAULT_GAME_PROCESS}:in_2"),
    }]
}

/// All timing constants, in seconds so the TOML stays readable.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Process-table poll interval for both the start wait and monitoring.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Consecutive missed polls before the game is judged gone.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Pause between starting the bridge and starting the launcher.
    #[serde(default = "default_warmup")]
    pub bridge_warmup_secs: u64,
    /// How long to wait for the game's JACK client to appear before
    /// connecting blind.
    #[serde(default = "default_registration_deadline")]
    pub registration_deadline_secs: u64,
    /// Settle time between client registration and port connection.
    #[serde(default = "default_stabilization")]
    pub stabilization_secs: u64,
    /// Execution timeout for each external control command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL at shutdown.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
    /// Pause after killing a wedged JACK server before restarting it.
    #[serde(default = "default_server_settle")]
    pub server_settle_secs: u64,
    /// Pause after `jack_control start` before trusting the server.
    #[serde(default = "default_server_stabilize")]
    pub server_stabilize_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            miss_threshold: default_miss_threshold(),
            bridge_warmup_secs: default_warmup(),
            registration_deadline_secs: default_registration_deadline(),
            stabilization_secs: default_stabilization(),
            command_timeout_secs: default_command_timeout(),
            terminate_grace_secs: default_terminate_grace(),
            server_settle_secs: default_server_settle(),
            server_stabilize_secs: default_server_stabilize(),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn bridge_warmup(&self) -> Duration {
        Duration::from_secs(self.bridge_warmup_secs)
    }

    pub fn registration_deadline(&self) -> Duration {
        Duration::from_secs(self.registration_deadline_secs)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_secs(self.stabilization_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn server_settle(&self) -> Duration {
        Duration::from_secs(self.server_settle_secs)
    }

    pub fn server_stabilize(&self) -> Duration {
        Duration::from_secs(self.server_stabilize_secs)
    }
}

fn default_bridge_command() -> String {
    DEFAULT_BRIDGE_COMMAND.to_string()
}

fn default_jack_client_name() -> String {
    DEFAULT_JACK_CLIENT_NAME.to_string()
}

fn default_alsa_device() -> String {
    DEFAULT_ALSA_DEVICE.to_string()
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_channels() -> u32 {
    DEFAULT_CHANNELS
}

fn default_launcher_path() -> String {
    DEFAULT_LAUNCHER_PATH.to_string()
}

fn default_game_process() -> String {
    DEFAULT_GAME_PROCESS.to_string()
}

fn default_audio_client() -> String {
    DEFAULT_AUDIO_CLIENT.to_string()
}

fn default_poll_interval() -> u64 {
    1
}

fn default_miss_threshold() -> u32 {
    10
}

fn default_warmup() -> u64 {
    3
}

fn default_registration_deadline() -> u64 {
    120
}

fn default_stabilization() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    5
}

fn default_terminate_grace() -> u64 {
    2
}

fn default_server_settle() -> u64 {
    2
}

fn default_server_stabilize() -> u64 {
    5
}

/// Loads the config file at `path`, returning `SessionConfig::default()` if
/// the file does not exist. Returns an error if the file exists but cannot
/// be read or parsed.
pub fn load_or_default(path: &Path) -> Result<SessionConfig> {
    if !path.exists() {
        return Ok(SessionConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_config_matches_single_cable_setup() {
        let c = SessionConfig::default();
        assert_eq!(c.bridge.command, "alsa_in");
        assert_eq!(
            c.bridge.args(),
            vec!["-j", "RTC_2", "-d", "hw:Adapter_1", "-r", "48000", "-c", "1"]
        );
        assert_eq!(c.game.process_name, "Rocksmith2014");
        assert_eq!(c.connections.len(), 1);
        assert_eq!(c.connections[0].src, "RTC_2:capture_1");
        assert_eq!(c.connections[0].dst, "Rocksmith2014:in_2");
    }

    #[test]
    fn default_timing_constants() {
        let t = TimingConfig::default();
        assert_eq!(t.poll_interval(), Duration::from_secs(1));
        assert_eq!(t.miss_threshold, 10);
        assert_eq!(t.bridge_warmup(), Duration::from_secs(3));
        assert_eq!(t.registration_deadline(), Duration::from_secs(120));
        assert_eq!(t.stabilization(), Duration::from_secs(10));
        assert_eq!(t.command_timeout(), Duration::from_secs(5));
        assert_eq!(t.terminate_grace(), Duration::from_secs(2));
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert_eq!(config.game.process_name, DEFAULT_GAME_PROCESS);
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[bridge]
jack_client_name = "RTC_1"
alsa_device = "hw:Scarlett"
channels = 2

[game]
launcher_path = "/opt/games/rs.sh"

[[connections]]
src = "RTC_1:capture_1"
dst = "Rocksmith2014:in_1"

[[connections]]
src = "RTC_1:capture_2"
dst = "Rocksmith2014:in_2"
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.bridge.jack_client_name, "RTC_1");
        assert_eq!(config.bridge.alsa_device, "hw:Scarlett");
        assert_eq!(config.bridge.channels, 2);
        assert_eq!(config.bridge.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.game.launcher_path, "/opt/games/rs.sh");
        assert_eq!(config.connections.len(), 2);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[timing]\nregistration_deadline_secs = 60\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.timing.registration_deadline_secs, 60);
        assert_eq!(config.timing.miss_threshold, 10);
        assert_eq!(config.bridge.command, DEFAULT_BRIDGE_COMMAND);
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }
}
