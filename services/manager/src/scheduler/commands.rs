//! Synchronous command interface between the API server and the
//! scheduler loop.
//!
//! Mutating operations travel as messages with oneshot replies; reads
//! go straight to the shared view snapshots (writers hold the lock only
//! to swap snapshots in, readers clone out).

use bosun_id::AppId;
use tokio::sync::{mpsc, oneshot};

use crate::scheduler::SharedViews;
use crate::state::{AppError, AppView, Version};

/// App operations accepted by the scheduler loop.
pub enum Command {
    CreateApp {
        version: Version,
        reply: oneshot::Sender<Result<AppView, AppError>>,
    },
    DeleteApp {
        app_id: AppId,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    ScaleUp {
        app_id: AppId,
        instances: u32,
        ips: Vec<String>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    ScaleDown {
        app_id: AppId,
        instances: u32,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    UpdateApp {
        app_id: AppId,
        version: Version,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    ProceedUpdate {
        app_id: AppId,
        instances: u32,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    CancelUpdate {
        app_id: AppId,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

/// Clonable handle the API server (and tests) use to drive the
/// scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) views: SharedViews,
}

impl SchedulerHandle {
    pub async fn create_app(&self, version: Version) -> Result<AppView, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateApp { version, reply })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    pub async fn delete_app(&self, app_id: AppId) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DeleteApp { app_id, reply })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    pub async fn scale_up(
        &self,
        app_id: AppId,
        instances: u32,
        ips: Vec<String>,
    ) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ScaleUp {
            app_id,
            instances,
            ips,
            reply,
        })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    pub async fn scale_down(&self, app_id: AppId, instances: u32) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ScaleDown {
            app_id,
            instances,
            reply,
        })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    pub async fn update_app(&self, app_id: AppId, version: Version) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateApp {
            app_id,
            version,
            reply,
        })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    pub async fn proceed_update(&self, app_id: AppId, instances: u32) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ProceedUpdate {
            app_id,
            instances,
            reply,
        })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    pub async fn cancel_update(&self, app_id: AppId) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelUpdate { app_id, reply })?;
        rx.await.map_err(|_| AppError::SchedulerUnavailable)?
    }

    /// Snapshot of every app, ordered by app id.
    pub fn list_apps(&self) -> Vec<AppView> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        let mut apps: Vec<AppView> = views.values().cloned().collect();
        apps.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        apps
    }

    /// Snapshot of one app.
    pub fn get_app(&self, app_id: &AppId) -> Option<AppView> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.get(app_id).cloned()
    }

    fn send(&self, command: Command) -> Result<(), AppError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| AppError::SchedulerUnavailable)
    }
}
