//! Device registration conform: appliances pushed to their manager.
//!
//! The local store is authoritative here. Appliances without a device
//! identifier get registered, drifted registrations get updated, and
//! registrations no local appliance points at get removed.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use warden_core::entities::{ApplianceInstance, ManagerConnector};
use warden_core::store::StoreTransaction;
use warden_core::{
    Entity, EntityId, EntityKey, Error as CoreError, ForeignId, ObjectKind, Result as CoreResult,
};
use warden_engine::{Guard, MetaTask, NotifyTask, Task, TaskContext, TaskGraph};

use crate::reconcile::{match_records, remote_call, tolerate_missing};

/// Conform pass diffing one manager's appliances against its device list.
///
/// Expansion produces one independent task per difference; the tasks
/// re-resolve their subjects when they run.
pub struct DeviceConform {
    manager: EntityId,
}

impl DeviceConform {
    /// Creates the pass over one manager's appliances.
    #[must_use]
    pub fn new(manager: EntityId) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MetaTask for DeviceConform {
    fn name(&self) -> String {
        format!(
            "conform devices of {}",
            EntityKey::new(ObjectKind::Manager, self.manager)
        )
    }

    async fn expand(&self, ctx: &TaskContext) -> CoreResult<TaskGraph> {
        let key = EntityKey::new(ObjectKind::Manager, self.manager);
        let versioned = ctx.store.load(key).await.ok_or(CoreError::NotFound(key))?;
        let manager = ManagerConnector::try_from(versioned.entity)?;

        let mut instances = Vec::new();
        for versioned in ctx.store.list(ObjectKind::Appliance).await {
            let instance = ApplianceInstance::try_from(versioned.entity)?;
            if instance.manager_id == self.manager {
                instances.push(instance);
            }
        }

        let api = ctx.apis.manager_api(&manager).await?;
        let devices = remote_call(
            "manager",
            "list devices",
            ctx.remote_timeout,
            api.list_devices(),
        )
        .await?;

        let outcome = match_records(
            instances,
            devices,
            |instance| instance.device_id.clone(),
            |device| device.id.clone(),
        );

        let mut graph = TaskGraph::new();
        for instance in outcome.local_only {
            graph.add_task(Arc::new(DeviceTask::new(
                self.manager,
                DeviceAction::Register {
                    instance: instance.id,
                },
            )));
        }
        for (instance, device) in outcome.matched {
            if instance.name != device.name || instance.ip != device.ip {
                graph.add_task(Arc::new(DeviceTask::new(
                    self.manager,
                    DeviceAction::Update {
                        instance: instance.id,
                    },
                )));
            }
        }
        for device in outcome.remote_only {
            graph.add_task(Arc::new(DeviceTask::new(
                self.manager,
                DeviceAction::Unregister { device: device.id },
            )));
        }

        if !graph.is_empty() {
            graph.append_task(
                Arc::new(NotifyTask::new(format!(
                    "device registrations conformed for '{}'",
                    manager.name
                ))),
                Guard::OnCompletion,
            );
        }
        Ok(graph)
    }
}

/// One difference a device conform pass found.
#[derive(Debug, Clone)]
pub enum DeviceAction {
    /// Register an appliance that has no device identifier yet.
    Register {
        /// Primary key of the appliance to register.
        instance: EntityId,
    },
    /// Push current appliance attributes over a drifted registration.
    Update {
        /// Primary key of the appliance to push.
        instance: EntityId,
    },
    /// Remove a registration no local appliance points at.
    Unregister {
        /// The manager's identifier for the orphaned registration.
        device: ForeignId,
    },
}

/// Applies one [`DeviceAction`] in a single store transaction.
pub struct DeviceTask {
    manager: EntityId,
    action: DeviceAction,
}

impl DeviceTask {
    /// Creates the task for `action`.
    #[must_use]
    pub fn new(manager: EntityId, action: DeviceAction) -> Self {
        Self { manager, action }
    }
}

#[async_trait]
impl Task for DeviceTask {
    fn name(&self) -> String {
        match &self.action {
            DeviceAction::Register { instance } => format!(
                "register device for {}",
                EntityKey::new(ObjectKind::Appliance, *instance)
            ),
            DeviceAction::Update { instance } => format!(
                "update device of {}",
                EntityKey::new(ObjectKind::Appliance, *instance)
            ),
            DeviceAction::Unregister { device } => format!("unregister device {device}"),
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> CoreResult<()> {
        let mut tx = StoreTransaction::begin(Arc::clone(&ctx.store));
        let manager_key = EntityKey::new(ObjectKind::Manager, self.manager);
        let manager = ManagerConnector::try_from(tx.load_required(manager_key).await?.entity)?;
        let api = ctx.apis.manager_api(&manager).await?;

        match &self.action {
            DeviceAction::Register { instance } => {
                let key = EntityKey::new(ObjectKind::Appliance, *instance);
                let mut record = ApplianceInstance::try_from(tx.load_required(key).await?.entity)?;

                let devices = remote_call(
                    "manager",
                    "list devices",
                    ctx.remote_timeout,
                    api.list_devices(),
                )
                .await?;
                if let Some(current) = &record.device_id {
                    // A recorded id only counts if the manager still knows it.
                    if devices.iter().any(|device| &device.id == current) {
                        debug!(appliance = %key, "already registered, nothing to do");
                        return Ok(());
                    }
                    debug!(
                        appliance = %key,
                        device = %current,
                        "recorded device is gone, replacing it"
                    );
                }

                // A crashed earlier pass may have registered the device and
                // then failed to commit the identifier. Adopt by name before
                // creating a duplicate.
                let device = match devices.into_iter().find(|device| device.name == record.name) {
                    Some(existing) => {
                        debug!(device = %existing.id, "adopting existing device registration");
                        if existing.ip != record.ip {
                            remote_call(
                                "manager",
                                "update device",
                                ctx.remote_timeout,
                                api.update_device(&existing.id, &record.name, &record.ip),
                            )
                            .await?;
                        }
                        existing
                    }
                    None => {
                        remote_call(
                            "manager",
                            "register device",
                            ctx.remote_timeout,
                            api.register_device(&record.name, &record.ip),
                        )
                        .await?
                    }
                };

                record.device_id = Some(device.id);
                tx.put(Entity::Appliance(record));
                tx.commit().await
            }
            DeviceAction::Update { instance } => {
                let key = EntityKey::new(ObjectKind::Appliance, *instance);
                let record = ApplianceInstance::try_from(tx.load_required(key).await?.entity)?;
                let Some(device_id) = record.device_id.clone() else {
                    return Err(CoreError::Conflict(format!(
                        "{key} no longer carries a device id"
                    )));
                };
                remote_call(
                    "manager",
                    "update device",
                    ctx.remote_timeout,
                    api.update_device(&device_id, &record.name, &record.ip),
                )
                .await?;
                tx.commit().await
            }
            DeviceAction::Unregister { device } => {
                tolerate_missing(
                    remote_call(
                        "manager",
                        "unregister device",
                        ctx.remote_timeout,
                        api.unregister_device(device),
                    )
                    .await,
                )?;
                tx.commit().await
            }
        }
    }
}
