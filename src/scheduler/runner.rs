use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::controller::{Phase, SchedulerController, SchedulerError, SchedulerEvent};
use super::job::JobState;
use crate::astro::Clock;
use crate::devices::{lock, Rig};

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub phase: Phase,
    pub current_job: Option<String>,
    pub jobs: Vec<(String, JobState)>,
}

struct Shared {
    controller: SchedulerController,
    rig: Rig,
    events: Vec<SchedulerEvent>,
}

struct WorkerHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Drives a [`SchedulerController`] on a tokio task, ticking it at a fixed
/// interval until the run stops.
pub struct Runner {
    shared: Arc<StdMutex<Shared>>,
    worker: Option<WorkerHandle>,
}

impl Runner {
    pub fn spawn(
        mut controller: SchedulerController,
        mut rig: Rig,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<Self, SchedulerError> {
        controller.start(&mut rig, clock.now())?;
        let events = controller.drain_events();
        let shared = Arc::new(StdMutex::new(Shared {
            controller,
            rig,
            events,
        }));

        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run_loop(shared.clone(), clock, interval, stop_rx));

        Ok(Self {
            shared,
            worker: Some(WorkerHandle { stop_tx, join }),
        })
    }

    pub fn status(&self) -> RunnerStatus {
        let locked = lock(&self.shared);
        let controller = &locked.controller;
        RunnerStatus {
            phase: controller.phase(),
            current_job: controller.current_job().map(|j| j.name.clone()),
            jobs: controller
                .jobs()
                .iter()
                .map(|j| (j.name.clone(), j.state))
                .collect(),
        }
    }

    pub fn drain_events(&self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut lock(&self.shared).events)
    }

    /// Requests a stop and waits for the shutdown sequence to finish.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if let Err(e) = worker.join.await {
                log::error!("Scheduler task failed: {}", e);
            }
        }
    }

    /// Waits for the run to end on its own.
    pub async fn wait(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            if let Err(e) = (&mut worker.join).await {
                log::error!("Scheduler task failed: {}", e);
            }
            self.worker = None;
        }
    }
}

async fn run_loop(
    shared: Arc<StdMutex<Shared>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut stopping = false;

    loop {
        let stop = tokio::select! {
            _ = ticker.tick() => false,
            _ = &mut stop_rx, if !stopping => true,
        };

        let mut locked = lock(&shared);
        let Shared {
            controller,
            rig,
            events,
        } = &mut *locked;
        let now = clock.now();
        if stop {
            stopping = true;
            controller.stop(rig, now);
        } else {
            controller.tick(rig, now);
        }
        events.extend(controller.drain_events());

        if !controller.is_running() {
            log::debug!("Scheduler loop finished");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::{AlignConfig, AlignmentController};
    use crate::astro::{local_sidereal_time, FixedClock, Frame, ObserverSite, OpticalGeometry, SkyCoordinate};
    use crate::devices::sim::{build, SimSettings};
    use crate::scheduler::controller::SchedulerSettings;
    use crate::scheduler::job::{JobTarget, ObservationJob};
    use crate::scheduler::journal::RunState;
    use crate::solver::SimulatedSolver;
    use chrono::{TimeZone, Utc};

    fn runner(slow_capture: bool) -> Runner {
        let now = Utc.with_ymd_and_hms(2026, 1, 12, 22, 0, 0).unwrap();
        let site = ObserverSite {
            latitude_deg: 48.0,
            longitude_deg: 11.0,
            altitude_m: 0.0,
        };
        let (rig, handles) = build(&SimSettings::default());
        if slow_capture {
            lock(&handles.sequencer).duration_polls = u32::MAX;
        }
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
        let solver = SimulatedSolver::new(handles.mount.clone(), clock.clone(), 1);
        let config = AlignConfig {
            optics: OpticalGeometry {
                focal_length_mm: Some(800.0),
                aperture_mm: Some(200.0),
                pixel_size_x_um: Some(3.8),
                pixel_size_y_um: Some(3.8),
                sensor_width_px: Some(1280),
                sensor_height_px: Some(1024),
                ..Default::default()
            },
            site,
            ..Default::default()
        };
        let align = AlignmentController::new(config, Box::new(solver), clock.clone());
        let target = SkyCoordinate::new(local_sidereal_time(now, 11.0), 40.0, Frame::Apparent)
            .unwrap()
            .to_j2000(now);
        let jobs = vec![ObservationJob::new("M42", JobTarget::Coordinates(target), "m42.esq")];
        let controller = SchedulerController::new(SchedulerSettings::default(), site, jobs, align);
        Runner::spawn(controller, rig, clock, Duration::from_millis(1)).unwrap()
    }

    #[tokio::test]
    async fn runs_until_the_scheduler_stops() {
        let mut runner = runner(false);
        runner.wait().await;
        let status = runner.status();
        assert_eq!(status.phase, Phase::Stopped);
        assert_eq!(status.jobs, vec![("M42".to_string(), JobState::Complete)]);
        let events = runner.drain_events();
        assert!(events.contains(&SchedulerEvent::Stopped(RunState::Completed)));
    }

    #[tokio::test]
    async fn stop_shuts_down_a_running_job() {
        let mut runner = runner(true);
        while runner.status().phase != Phase::Capturing {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        runner.stop().await;
        let status = runner.status();
        assert_eq!(status.phase, Phase::Stopped);
        assert_eq!(status.jobs[0].1, JobState::Aborted);
        assert!(runner
            .drain_events()
            .contains(&SchedulerEvent::Stopped(RunState::Stopped)));
    }
}
