use crate::media::{CaptureConstraints, VideoConstraints};
use crate::peer::IceServer;
use crate::signaling::ReconnectPolicy;
use std::env;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8081";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.kundenserver.de:3478";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid signaling url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("unsupported signaling url scheme {0:?}; expected ws, wss, http or https")]
    UnsupportedScheme(String),
    #[error("invalid value {value:?} for {var}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub signaling_url: Url,
    pub ice_servers: Vec<IceServer>,
    pub capture: CaptureConstraints,
    pub reconnect: ReconnectPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            capture: CaptureConstraints::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn default_signaling_url() -> Url {
    Url::parse(DEFAULT_SIGNALING_URL).expect("default signaling url is valid")
}

impl CallConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = env::var("CONCH_SIGNALING_URL") {
            config.signaling_url = signaling_url(&url)?;
        }
        if let Ok(servers) = env::var("CONCH_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&servers);
        }
        if let (Ok(username), Ok(credential)) = (
            env::var("CONCH_TURN_USERNAME"),
            env::var("CONCH_TURN_CREDENTIAL"),
        ) {
            config.apply_turn_credentials(&username, &credential);
        }

        let width = env_number("CONCH_VIDEO_WIDTH")?;
        let height = env_number("CONCH_VIDEO_HEIGHT")?;
        if let Some(video) = config.capture.video.as_mut() {
            if let Some(width) = width {
                video.width = width;
            }
            if let Some(height) = height {
                video.height = height;
            }
        }
        let video_disabled = env::var("CONCH_DISABLE_VIDEO")
            .is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));
        if video_disabled {
            config.capture.video = None;
        }

        if let Some(attempts) = env_number::<u32>("CONCH_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }

        Ok(config)
    }

    pub fn with_signaling_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.signaling_url = signaling_url(url)?;
        Ok(self)
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// No STUN/TURN at all; only host candidates are gathered.
    pub fn localhost(mut self) -> Self {
        self.ice_servers.clear();
        self
    }

    pub fn with_video(mut self, video: Option<VideoConstraints>) -> Self {
        self.capture.video = video;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Credentials only make sense for TURN entries; STUN ones are left alone.
    pub fn apply_turn_credentials(&mut self, username: &str, credential: &str) {
        for server in &mut self.ice_servers {
            if server
                .urls
                .iter()
                .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
            {
                server.username = Some(username.to_owned());
                server.credential = Some(credential.to_owned());
            }
        }
    }
}

/// Accepts ws(s) as is and maps http(s) onto ws(s).
pub fn signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_owned(),
        source,
    })?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_owned()))?;
    Ok(url)
}

/// Comma separated ICE urls; an empty string disables STUN/TURN.
pub fn parse_ice_servers(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(IceServer::new)
        .collect()
}

fn env_number<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(None),
    }
}
