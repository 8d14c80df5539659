//! # JSON-Lines Position Feed
//!
//! Headless stand-in for the platform location capability. One JSON object
//! per line, read from stdin or from the file named by `GEOTRACK_FEED`:
//!
//! ```text
//! {"type":"fix","lat":48.8566,"lng":2.3522,"accuracy":12.0,"time":1714552200000}
//! {"type":"fix","lat":48.8570,"lng":2.3530,"accuracy":9.5,"provider":"gps","speed":1.4}
//! {"type":"unavailable","reason":"gps off"}
//! {"type":"available"}
//! {"type":"permission_revoked"}
//! ```
//!
//! `time` is epoch milliseconds and defaults to the moment the line is read.
//! Malformed lines are logged and skipped.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use geotrack_core::Position;
use geotrack_sync::{CaptureError, LocationProvider, LocationRequest, Permission, ProviderEvent};

type FeedLines = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// One line of the feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedLine {
    Fix {
        lat: f64,
        lng: f64,
        accuracy: f64,
        #[serde(default)]
        time: Option<i64>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        speed: Option<f64>,
        #[serde(default)]
        altitude: Option<f64>,
        #[serde(default)]
        bearing: Option<f64>,
    },
    Unavailable {
        #[serde(default)]
        reason: String,
    },
    Available,
    PermissionRevoked,
}

impl FeedLine {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn into_event(self, now: DateTime<Utc>) -> ProviderEvent {
        match self {
            FeedLine::Fix {
                lat,
                lng,
                accuracy,
                time,
                provider,
                speed,
                altitude,
                bearing,
            } => {
                let captured_at = time
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or(now);
                let mut position = Position::new(captured_at, lat, lng, accuracy);
                position.provider = provider;
                position.speed_mps = speed;
                position.altitude_m = altitude;
                position.bearing_deg = bearing;
                ProviderEvent::Fix(position)
            }
            FeedLine::Unavailable { reason } => ProviderEvent::Unavailable(reason),
            FeedLine::Available => ProviderEvent::Available,
            FeedLine::PermissionRevoked => ProviderEvent::PermissionRevoked,
        }
    }
}

/// [`LocationProvider`] reading [`FeedLine`]s.
///
/// The reader is shared across sampling sessions, so a restart continues
/// where the previous session stopped reading.
pub struct JsonLinesProvider {
    lines: Arc<AsyncMutex<FeedLines>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl JsonLinesProvider {
    pub fn new(reader: Box<dyn AsyncBufRead + Send + Unpin>) -> Self {
        JsonLinesProvider {
            lines: Arc::new(AsyncMutex::new(reader.lines())),
            forwarder: Mutex::new(None),
        }
    }

    /// Reads `GEOTRACK_FEED` if set, stdin otherwise.
    pub async fn from_env() -> std::io::Result<Self> {
        match std::env::var_os("GEOTRACK_FEED").map(PathBuf::from) {
            Some(path) => {
                info!(path = %path.display(), "Reading positions from file");
                let file = tokio::fs::File::open(&path).await?;
                Ok(Self::new(Box::new(BufReader::new(file))))
            }
            None => {
                info!("Reading positions from stdin");
                Ok(Self::new(Box::new(BufReader::new(tokio::io::stdin()))))
            }
        }
    }
}

async fn forward(lines: Arc<AsyncMutex<FeedLines>>, events: mpsc::Sender<ProviderEvent>) {
    let mut lines = lines.lock().await;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Position feed ended");
                break;
            }
            Err(err) => {
                warn!(?err, "Position feed read failed");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match FeedLine::parse(line) {
            Ok(parsed) => {
                if events.send(parsed.into_event(Utc::now())).await.is_err() {
                    debug!("Sampling stopped, feed paused");
                    break;
                }
            }
            Err(err) => warn!(%err, line, "Skipping malformed feed line"),
        }
    }
}

#[async_trait]
impl LocationProvider for JsonLinesProvider {
    async fn permission(&self) -> Permission {
        Permission::Granted
    }

    async fn request_updates(
        &self,
        request: &LocationRequest,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<(), CaptureError> {
        debug!(?request, "Feed subscription");
        let task = tokio::spawn(forward(self.lines.clone(), events));
        let previous = self
            .forwarder
            .lock()
            .map_err(|_| CaptureError::ProviderUnavailable("feed state poisoned".into()))?
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn remove_updates(&self) {
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(task) = forwarder.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_sync::Priority;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn request() -> LocationRequest {
        LocationRequest {
            priority: Priority::HighAccuracy,
            interval: Duration::from_secs(300),
            min_interval: Duration::from_secs(60),
            min_displacement_m: 100.0,
            wait_for_accurate: true,
        }
    }

    fn provider(input: &str) -> JsonLinesProvider {
        JsonLinesProvider::new(Box::new(BufReader::new(Cursor::new(input.as_bytes().to_vec()))))
    }

    #[test]
    fn test_parse_fix() {
        let line = r#"{"type":"fix","lat":48.85,"lng":2.35,"accuracy":12.0,"time":1714552200000,"speed":1.5}"#;
        let event = FeedLine::parse(line).unwrap().into_event(Utc::now());

        let ProviderEvent::Fix(position) = event else {
            panic!("expected a fix");
        };
        assert_eq!(position.latitude, 48.85);
        assert_eq!(position.captured_at.timestamp_millis(), 1714552200000);
        assert_eq!(position.speed_mps, Some(1.5));
        assert_eq!(position.provider, None);
    }

    #[test]
    fn test_missing_time_uses_read_instant() {
        let now = Utc::now();
        let event = FeedLine::parse(r#"{"type":"fix","lat":1.0,"lng":2.0,"accuracy":5.0}"#)
            .unwrap()
            .into_event(now);
        assert!(matches!(event, ProviderEvent::Fix(p) if p.captured_at == now));
    }

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(
            FeedLine::parse(r#"{"type":"unavailable","reason":"tunnel"}"#).unwrap(),
            FeedLine::Unavailable { reason: "tunnel".into() }
        );
        assert_eq!(
            FeedLine::parse(r#"{"type":"permission_revoked"}"#).unwrap(),
            FeedLine::PermissionRevoked
        );
        assert!(FeedLine::parse(r#"{"type":"teleport"}"#).is_err());
    }

    #[tokio::test]
    async fn test_forwards_lines_and_skips_garbage() {
        let feed = provider(concat!(
            "{\"type\":\"fix\",\"lat\":1.0,\"lng\":2.0,\"accuracy\":5.0}\n",
            "not json\n",
            "\n",
            "{\"type\":\"available\"}\n",
        ));
        let (tx, mut rx) = mpsc::channel(8);
        feed.request_updates(&request(), tx).await.unwrap();

        assert!(matches!(rx.recv().await, Some(ProviderEvent::Fix(_))));
        assert_eq!(rx.recv().await, Some(ProviderEvent::Available));
        // end of input closes the channel
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_remove_updates_pauses_and_restart_resumes() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let feed = JsonLinesProvider::new(Box::new(BufReader::new(reader)));
        let line = |ms: i64| {
            format!("{{\"type\":\"fix\",\"lat\":1.0,\"lng\":2.0,\"accuracy\":5.0,\"time\":{ms}}}\n")
        };

        let (tx, mut rx) = mpsc::channel(8);
        feed.request_updates(&request(), tx).await.unwrap();
        writer.write_all(line(1000).as_bytes()).await.unwrap();
        let Some(ProviderEvent::Fix(first)) = rx.recv().await else {
            panic!("expected a fix");
        };
        assert_eq!(first.captured_at.timestamp_millis(), 1000);

        feed.remove_updates();
        writer.write_all(line(2000).as_bytes()).await.unwrap();
        assert_eq!(rx.recv().await, None);

        let (tx, mut rx) = mpsc::channel(8);
        feed.request_updates(&request(), tx).await.unwrap();
        let Some(ProviderEvent::Fix(second)) = rx.recv().await else {
            panic!("expected a fix");
        };
        assert_eq!(second.captured_at.timestamp_millis(), 2000);
    }
}
