use std::collections::BTreeMap;

use tracing::{info, warn};

use super::phase::{classify_phase, is_serving};
use super::transform::{allocate_ports, render};
use super::{EngineError, RuntimeEngine};
use crate::api::{
    CacheRuntime, ConditionStatus, ConditionType, RuntimeCondition, RuntimePhase, reasons,
    set_condition,
};
use crate::port_parser::{VALUES_KEY, values_configmap_name};

impl RuntimeEngine {
    /// True only while the master has never been set up.
    pub fn should_setup_master(runtime: &CacheRuntime) -> bool {
        runtime.status.master_phase == RuntimePhase::None
    }

    /// Install the release if the master does not exist yet, otherwise reconcile
    /// its replica count. Records `MasterInitialized` either way.
    pub async fn setup_master(&mut self) -> Result<(), EngineError> {
        let runtime = self.get_runtime().await?;
        let master = self.master_name();
        let replicas = runtime.master_replicas();

        match self.ctx.cluster.get_statefulset(&self.namespace, &master).await {
            Ok(_) => {
                info!(namespace = %self.namespace, runtime = %self.name, "master exists, reconciling replicas");
                self.scale_statefulset(&master, replicas).await?;
            }
            Err(e) if e.is_not_found() => {
                if self
                    .ctx
                    .releases
                    .check_release(&self.name, &self.namespace)
                    .await?
                {
                    info!(namespace = %self.namespace, runtime = %self.name, "release already installed");
                } else {
                    self.install_release(&runtime).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        let value_file = values_configmap_name(&self.name, self.runtime_type());
        self.update_runtime_status(|rt| {
            let status = &mut rt.status;
            status.master_phase = RuntimePhase::NotReady;
            status.desired_master_number_scheduled = replicas;
            status.value_file = value_file.clone();
            set_condition(
                &mut status.conditions,
                RuntimeCondition::new(
                    ConditionType::MasterInitialized,
                    ConditionStatus::True,
                    reasons::MASTER_INITIALIZED,
                    "The master is initialized.",
                ),
            );
        })
        .await?;
        Ok(())
    }

    /// Render values, persist them and install the release. Ports reserved for a
    /// failed install are given back.
    async fn install_release(&mut self, runtime: &CacheRuntime) -> Result<(), EngineError> {
        let info = self.runtime_info().await?;
        let ports = allocate_ports(runtime, &self.profile, &self.ctx.ports)?;
        let values = render(runtime, &info, &ports, &self.ctx.settings);
        let cm_name = values_configmap_name(&self.name, self.runtime_type());

        let result = async {
            let yaml = serde_yaml::to_string(&values)?;
            self.ctx
                .cluster
                .apply_configmap(
                    &self.namespace,
                    &cm_name,
                    BTreeMap::from([(VALUES_KEY.to_string(), yaml.clone())]),
                )
                .await?;

            tokio::fs::create_dir_all(&self.ctx.settings.values_dir).await?;
            let file = tempfile::Builder::new()
                .prefix(&format!("{}-{}-", self.name, self.runtime_type()))
                .suffix(".yaml")
                .tempfile_in(&self.ctx.settings.values_dir)?;
            tokio::fs::write(file.path(), yaml.as_bytes()).await?;

            self.ctx
                .releases
                .install_release(&self.name, &self.namespace, file.path(), &self.ctx.settings.chart)
                .await?;
            Ok::<_, EngineError>(())
        }
        .await;

        if let Err(e) = result {
            if ports.reserved {
                self.ctx.ports.release_reserved_ports(&ports.to_vec());
            }
            if let Err(cleanup) = self.ctx.cluster.delete_configmap(&self.namespace, &cm_name).await {
                warn!(namespace = %self.namespace, configmap = %cm_name, error = %cleanup, "failed to remove values after failed install");
            }
            return Err(e);
        }

        if let Some(metrics) = &self.ctx.metrics {
            metrics.set_ports_reserved(self.ctx.ports.reserved_count());
        }
        info!(namespace = %self.namespace, runtime = %self.name, ports = ?ports.to_vec(), "installed runtime release");
        Ok(())
    }

    /// Classify the master from its StatefulSet and record `MasterReady`.
    /// Returns whether at least one master replica is ready.
    pub async fn check_master_ready(&mut self) -> Result<bool, EngineError> {
        let runtime = self.get_runtime().await?;
        let desired = runtime.master_replicas();
        let (current, ready) = match self
            .ctx
            .cluster
            .get_statefulset(&self.namespace, &self.master_name())
            .await
        {
            Ok(sts) => {
                let status = sts.status.unwrap_or_default();
                (status.replicas, status.ready_replicas.unwrap_or(0))
            }
            Err(e) if e.is_not_found() => (0, 0),
            Err(e) => return Err(e.into()),
        };
        let phase = classify_phase(desired, ready);
        let serving = is_serving(phase);

        self.update_runtime_status(|rt| {
            let status = &mut rt.status;
            status.master_phase = phase;
            status.desired_master_number_scheduled = desired;
            status.current_master_number_scheduled = current;
            status.master_number_ready = ready;
            let cond = if serving {
                RuntimeCondition::new(
                    ConditionType::MasterReady,
                    ConditionStatus::True,
                    reasons::MASTER_READY,
                    "The master is ready.",
                )
            } else {
                RuntimeCondition::new(
                    ConditionType::MasterReady,
                    ConditionStatus::False,
                    reasons::MASTER_NOT_READY,
                    format!("{ready} of {desired} master replicas are ready."),
                )
            };
            set_condition(&mut status.conditions, cond);
        })
        .await?;
        Ok(serving)
    }
}
