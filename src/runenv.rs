use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{block::ContentHandle, util::deserialize_size};

/// Download measurements, in the wire shape result collectors expect.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stat {
    #[serde(rename_all = "camelCase")]
    SingleDownloadSpeed {
        content_id: ContentHandle,
        #[serde(with = "nanos")]
        duration: Duration,
    },
    #[serde(rename_all = "camelCase")]
    MultipleDownloadSpeed {
        block_count: usize,
        #[serde(with = "nanos")]
        total_duration: Duration,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Message { message: String },
    Stat { stat: Stat },
    Success,
    Failure { error: String },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Event {
    pub ts: i64,
    pub participant: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Where recorded events end up besides the log. A retaining sink keeps them
/// in memory, which is what simulations and tests read back.
#[derive(Default)]
pub struct Sink {
    file: Option<Mutex<File>>,
    retained: Option<Mutex<Vec<Event>>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Params {
    #[serde(deserialize_with = "deserialize_size")]
    pub size: usize,

    pub block_count: usize,

    // only requestors read it
    #[serde(default)]
    pub provider_count: Option<usize>,
}

pub struct RunEnv {
    pub participant: String,
    pub run_id: String,
    pub test_case: String,
    pub group: String,
    pub instance_count: u64,
    pub params: Params,
    sink: Arc<Sink>,
}

mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

impl Sink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| anyhow!("could not open results file {}: {e}", path.display()))?;

        Ok(Self {
            file: Some(Mutex::new(file)),
            retained: None,
        })
    }

    pub fn retaining() -> Self {
        Self::none().retain()
    }

    /// Also keep every event in memory, see `events`.
    pub fn retain(mut self) -> Self {
        self.retained = Some(Mutex::new(vec![]));
        self
    }

    fn write(&self, event: Event) {
        if let Err(e) = self.write_impl(event) {
            warn!("Failed to record event: {e}. ");
        }
    }

    fn write_impl(&self, event: Event) -> Result<()> {
        if let Some(file) = &self.file {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            file.lock()
                .map_err(|_| anyhow!("failed to acquire lock"))?
                .write_all(line.as_bytes())?;
        }

        if let Some(retained) = &self.retained {
            retained.lock().map_err(|_| anyhow!("failed to acquire lock"))?.push(event);
        }

        Ok(())
    }

    pub fn events(&self) -> Vec<Event> {
        match &self.retained {
            Some(retained) => retained.lock().map(|events| events.clone()).unwrap_or_default(),
            None => vec![],
        }
    }

    pub fn events_of(&self, participant: &str) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|event| event.participant == participant)
            .map(|event| event.kind)
            .collect()
    }
}

impl RunEnv {
    pub fn new(
        participant: String,
        run_id: String,
        test_case: String,
        group: String,
        instance_count: u64,
        params: Params,
        sink: Arc<Sink>,
    ) -> Self {
        Self {
            participant,
            run_id,
            test_case,
            group,
            instance_count,
            params,
            sink,
        }
    }

    fn emit(&self, kind: EventKind) {
        self.sink.write(Event {
            ts: Utc::now().timestamp_millis(),
            participant: self.participant.clone(),
            kind,
        });
    }

    pub fn record_message(&self, message: &str) {
        info!("[{}] {message}. ", self.participant);
        self.emit(EventKind::Message {
            message: message.to_string(),
        });
    }

    pub fn record_stat(&self, stat: &Stat) {
        match serde_json::to_string(stat) {
            Ok(json) => info!("[{}] {json}", self.participant),
            Err(e) => warn!("Failed to serialize measurement: {e}. "),
        }

        self.emit(EventKind::Stat { stat: stat.clone() });
    }

    pub fn record_success(&self) {
        info!("[{}] Run {} succeeded. ", self.participant, self.run_id);
        self.emit(EventKind::Success);
    }

    pub fn record_outcome(&self, result: &Result<()>) {
        match result {
            Ok(()) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
    }

    pub fn record_failure(&self, e: &anyhow::Error) {
        error!("[{}] Run {} failed: {e:#}. ", self.participant, self.run_id);
        self.emit(EventKind::Failure {
            error: format!("{e:#}"),
        });
    }
}
