//! Name registry for journeys, data pools, volume models, and scenario sets.
//!
//! There is no runtime code loading: everything executable is registered
//! under a stable string name at program start, and only those names travel
//! over the wire. Controllers resolve pool/volume/scenario-set names when
//! building scenarios; runners resolve journey names when executing grants.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::context::Context;
use crate::datapool::{DataPool, PoolError};
use crate::errors::JourneyError;
use crate::volume::VolumeModel;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("no {kind} registered under name '{name}'")]
    Unknown { kind: &'static str, name: String },

    #[error("failed to build data pool '{name}': {source}")]
    PoolBuild {
        name: String,
        #[source]
        source: PoolError,
    },
}

/// A registered journey: user code executing one logical interaction
/// sequence against the target.
pub type JourneyFn =
    Arc<dyn Fn(Context, Option<Value>) -> BoxFuture<'static, Result<(), JourneyError>> + Send + Sync>;

type PoolFactory = Arc<dyn Fn() -> Result<Box<dyn DataPool>, PoolError> + Send + Sync>;
type VolumeFactory = Arc<dyn Fn() -> Box<dyn VolumeModel> + Send + Sync>;

/// One scenario declaration inside a scenario set: names only.
#[derive(Debug, Clone)]
pub struct ScenarioDef {
    pub journey: String,
    pub datapool: Option<String>,
    pub volume: String,
}

#[derive(Default)]
pub struct Registry {
    journeys: HashMap<String, JourneyFn>,
    datapools: HashMap<String, PoolFactory>,
    volumes: HashMap<String, VolumeFactory>,
    scenario_sets: HashMap<String, Vec<ScenarioDef>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            registry: Registry::default(),
        }
    }

    pub fn journey(&self, name: &str) -> Result<JourneyFn, SpecError> {
        self.journeys.get(name).cloned().ok_or(SpecError::Unknown {
            kind: "journey",
            name: name.to_string(),
        })
    }

    /// Build a fresh pool instance from its registered factory.
    pub fn datapool(&self, name: &str) -> Result<Box<dyn DataPool>, SpecError> {
        let factory = self.datapools.get(name).ok_or(SpecError::Unknown {
            kind: "data pool",
            name: name.to_string(),
        })?;
        factory().map_err(|source| SpecError::PoolBuild {
            name: name.to_string(),
            source,
        })
    }

    pub fn volume(&self, name: &str) -> Result<Box<dyn VolumeModel>, SpecError> {
        let factory = self.volumes.get(name).ok_or(SpecError::Unknown {
            kind: "volume model",
            name: name.to_string(),
        })?;
        Ok(factory())
    }

    pub fn scenario_set(&self, name: &str) -> Result<&[ScenarioDef], SpecError> {
        self.scenario_sets
            .get(name)
            .map(Vec::as_slice)
            .ok_or(SpecError::Unknown {
                kind: "scenario set",
                name: name.to_string(),
            })
    }
}

pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn journey<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Context, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), JourneyError>> + Send + 'static,
    {
        self.registry
            .journeys
            .insert(name.to_string(), Arc::new(move |ctx, args| f(ctx, args).boxed()));
        self
    }

    pub fn datapool<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn DataPool>, PoolError> + Send + Sync + 'static,
    {
        self.registry
            .datapools
            .insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn volume<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn VolumeModel> + Send + Sync + 'static,
    {
        self.registry
            .volumes
            .insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn scenario_set(mut self, name: &str, scenarios: Vec<ScenarioDef>) -> Self {
        self.registry
            .scenario_sets
            .insert(name.to_string(), scenarios);
        self
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(self.registry)
    }
}
