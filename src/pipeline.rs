//! Run orchestration.
//!
//! Owns the versioned dimension stores for the lifetime of the pipeline and
//! drives one batch end to end: calendar dimensions, entity dimensions, fact
//! resolution, the data-quality gate, then hand-off to the load collaborator.
//! A storage failure rolls the stores back to their pre-batch state so a
//! partial commit can never leave a half-applied version change behind.

use crate::builder::DimensionBuilder;
use crate::calendar::{build_date_dimension, build_event_type_dimension, build_time_dimension};
use crate::config::EtlConfig;
use crate::error::{DwhError, Result};
use crate::facts::FactResolver;
use crate::model::{
    AttrValue, AttributeMap, DimensionRow, DimensionSnapshot, FactRow, QualitySummary,
    DIM_DATE, DIM_ENVIRONMENTAL, DIM_EVENT_TYPE, DIM_LOCATION, DIM_TIME, DIM_VEHICLE,
    FACT_TRAFFIC_EVENTS,
};
use crate::quality::QualityCounters;
use crate::records::SourceBatch;
use crate::store::DimensionStore;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use tracing::{error, info};

/// Persistence collaborator. Implementations own transactions and physical
/// layout; a failure from either method aborts the run as a storage error.
pub trait WarehouseLoader {
    fn load_dimension(&mut self, name: &str, rows: &[DimensionRow]) -> Result<()>;
    fn load_facts(&mut self, table: &str, rows: &[FactRow]) -> Result<()>;
}

/// Everything one run hands to the loader, plus the quality summary.
#[derive(Debug)]
pub struct RunOutput {
    pub dimensions: HashMap<String, Vec<DimensionRow>>,
    pub facts: HashMap<String, Vec<FactRow>>,
    pub summary: QualitySummary,
}

pub struct Pipeline {
    config: EtlConfig,
    location_store: DimensionStore,
    vehicle_store: DimensionStore,
    environmental_store: DimensionStore,
}

impl Pipeline {
    /// Build a pipeline, validating up front that every versioned dimension
    /// has a tracked attribute set configured.
    pub fn new(config: EtlConfig) -> Result<Self> {
        let location_store = DimensionStore::new(
            DIM_LOCATION,
            config.tracked_for(DIM_LOCATION)?.to_vec(),
            unknown_attributes(&["location_name", "location_source"]),
        );
        let vehicle_store = DimensionStore::new(
            DIM_VEHICLE,
            config.tracked_for(DIM_VEHICLE)?.to_vec(),
            unknown_attributes(&["vehicle_id", "vehicle_type", "vehicle_category"]),
        );
        let environmental_store = DimensionStore::new(
            DIM_ENVIRONMENTAL,
            config.tracked_for(DIM_ENVIRONMENTAL)?.to_vec(),
            unknown_attributes(&["weather_condition"]),
        );
        Ok(Pipeline {
            config,
            location_store,
            vehicle_store,
            environmental_store,
        })
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Current state of the versioned dimension stores, keyed by dimension
    /// name. Calendar dimensions are regenerated per run and not held here.
    pub fn dimension_state(&self) -> HashMap<String, DimensionSnapshot> {
        let mut state = HashMap::new();
        for store in [
            &self.location_store,
            &self.vehicle_store,
            &self.environmental_store,
        ] {
            state.insert(store.name().to_string(), store.snapshot());
        }
        state
    }

    /// Run one batch: dimensions, facts, quality gate, load. Returns the
    /// produced collections so callers can inspect what was handed over.
    ///
    /// A failing run leaves the stores exactly as they were before the
    /// batch: any version change applied along the way is rolled back.
    pub fn run(
        &self,
        batch: &SourceBatch,
        observed_at: NaiveDateTime,
        loader: &mut dyn WarehouseLoader,
    ) -> Result<RunOutput> {
        let checkpoints = [
            self.location_store.checkpoint(),
            self.vehicle_store.checkpoint(),
            self.environmental_store.checkpoint(),
        ];

        match self.run_batch(batch, observed_at, loader) {
            Ok(output) => Ok(output),
            Err(err) => {
                let [locations, vehicles, environment] = checkpoints;
                self.location_store.restore(locations);
                self.vehicle_store.restore(vehicles);
                self.environmental_store.restore(environment);
                error!(%err, "run failed, dimension changes rolled back");
                Err(err)
            }
        }
    }

    fn run_batch(
        &self,
        batch: &SourceBatch,
        observed_at: NaiveDateTime,
        loader: &mut dyn WarehouseLoader,
    ) -> Result<RunOutput> {
        let quality = QualityCounters::new();
        let mut dimensions: HashMap<String, DimensionSnapshot> = HashMap::new();
        dimensions.insert(
            DIM_DATE.to_string(),
            build_date_dimension(&self.config.calendar),
        );
        dimensions.insert(DIM_TIME.to_string(), build_time_dimension());
        dimensions.insert(DIM_EVENT_TYPE.to_string(), build_event_type_dimension());
        dimensions.insert(
            DIM_LOCATION.to_string(),
            DimensionBuilder::build_location_dimension(
                batch,
                &self.location_store,
                observed_at,
                &quality,
            )?,
        );
        dimensions.insert(
            DIM_VEHICLE.to_string(),
            DimensionBuilder::build_vehicle_dimension(
                batch,
                &self.vehicle_store,
                observed_at,
                &quality,
            )?,
        );
        dimensions.insert(
            DIM_ENVIRONMENTAL.to_string(),
            DimensionBuilder::build_environmental_dimension(
                batch,
                &self.environmental_store,
                observed_at,
                &quality,
            )?,
        );

        let resolver = FactResolver::new(&self.config, &dimensions)?;
        let facts = resolver.resolve_batch(batch, &quality);

        let summary = quality.summary();
        self.enforce_skip_threshold(&summary)?;

        let mut output = RunOutput {
            dimensions: dimensions
                .into_iter()
                .map(|(name, snapshot)| (name, snapshot.rows))
                .collect(),
            facts: HashMap::new(),
            summary,
        };
        output.facts.insert(FACT_TRAFFIC_EVENTS.to_string(), facts);

        self.load(&output, loader)?;

        info!(
            facts = output.facts[FACT_TRAFFIC_EVENTS].len(),
            skipped = output.summary.rows_skipped_total(),
            "pipeline run complete"
        );
        Ok(output)
    }

    fn load(&self, output: &RunOutput, loader: &mut dyn WarehouseLoader) -> Result<()> {
        // Dimensions first so facts never reference rows the warehouse has
        // not seen.
        for name in [
            DIM_DATE,
            DIM_TIME,
            DIM_EVENT_TYPE,
            DIM_LOCATION,
            DIM_VEHICLE,
            DIM_ENVIRONMENTAL,
        ] {
            loader.load_dimension(name, &output.dimensions[name])?;
        }
        loader.load_facts(FACT_TRAFFIC_EVENTS, &output.facts[FACT_TRAFFIC_EVENTS])?;
        Ok(())
    }

    fn enforce_skip_threshold(&self, summary: &QualitySummary) -> Result<()> {
        if summary.source_rows_total == 0 {
            return Ok(());
        }
        let skipped = summary.rows_skipped_total();
        let ratio = skipped as f64 / summary.source_rows_total as f64;
        if ratio > self.config.max_skip_ratio {
            return Err(DwhError::QualityThreshold(format!(
                "{} of {} source rows skipped ({:.0}% > {:.0}% allowed)",
                skipped,
                summary.source_rows_total,
                ratio * 100.0,
                self.config.max_skip_ratio * 100.0
            )));
        }
        Ok(())
    }
}

fn unknown_attributes(names: &[&str]) -> AttributeMap {
    names
        .iter()
        .map(|n| (n.to_string(), AttrValue::Text("Unknown".to_string())))
        .collect()
}
