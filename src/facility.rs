use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::compactor;
use crate::config::BookingPolicy;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine, WAL file and compactor per facility. The facility is the
/// database name a client connects to.
pub struct FacilityManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: BookingPolicy,
    clock: Arc<dyn Clock>,
}

impl FacilityManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: BookingPolicy) -> Self {
        Self::with_clock(data_dir, compact_threshold, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        data_dir: PathBuf,
        compact_threshold: u64,
        policy: BookingPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
            clock,
        }
    }

    /// Only letters, digits, `_` and `-` survive, so the name is safe as a file stem.
    fn file_stem(facility: &str) -> io::Result<String> {
        if facility.len() > MAX_FACILITY_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "facility name too long",
            ));
        }
        let stem: String = facility
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if stem.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty facility name",
            ));
        }
        Ok(stem)
    }

    /// Engine for `facility`, opened (and its WAL replayed) on first use.
    /// Names that sanitize to the same stem share one engine, since they
    /// share one WAL file.
    pub fn get_or_create(&self, facility: &str) -> io::Result<Arc<Engine>> {
        let stem = Self::file_stem(facility)?;
        if let Some(engine) = self.engines.get(&stem) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_FACILITIES {
            return Err(io::Error::other("too many facilities"));
        }

        let engine = match self.engines.entry(stem.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::with_options(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.policy,
                    self.clock.clone(),
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(facility = %stem, "facility engine opened");
        Ok(engine)
    }

    pub fn facility_count(&self) -> usize {
        self.engines.len()
    }
}
