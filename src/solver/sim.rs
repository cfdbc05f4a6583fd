use std::sync::Arc;

use super::{
    error::SolveError,
    types::{SolveCompletion, SolveRequest, SolveResult},
    PlateSolver,
};
use crate::astro::Clock;
use crate::devices::sim::{lock, MountState, Shared, SIM_FRAME_DIR};

/// Solver that "sees" wherever the simulated mount truly points.
///
/// Frames from the simulated camera solve to the true mount position converted
/// to J2000; any other image solves to the centre of its search hint.
pub struct SimulatedSolver {
    mount: Shared<MountState>,
    clock: Arc<dyn Clock>,
    polls: u32,
    /// Extra error added to every solution, in arcseconds of Dec.
    pub offset_arcsec: f64,
    pub pending_failures: u32,
    pub pixel_scale: f64,
    pending: Option<(SolveRequest, u32)>,
    submitted: Shared<Vec<SolveRequest>>,
}

impl SimulatedSolver {
    pub fn new(mount: Shared<MountState>, clock: Arc<dyn Clock>, polls: u32) -> Self {
        Self {
            mount,
            clock,
            polls,
            offset_arcsec: 0.0,
            pending_failures: 0,
            pixel_scale: 1.5,
            pending: None,
            submitted: Shared::default(),
        }
    }

    /// Every request submitted so far, shared so it stays readable once the
    /// solver is boxed into a controller.
    pub fn submitted(&self) -> Shared<Vec<SolveRequest>> {
        self.submitted.clone()
    }

    fn solve(&self, request: &SolveRequest) -> Result<SolveResult, SolveError> {
        let (ra_deg, dec_deg) = if request.image.starts_with(SIM_FRAME_DIR) {
            let pointing = lock(&self.mount).true_pointing();
            let j2000 = pointing.to_j2000(self.clock.now());
            (j2000.ra_degrees(), j2000.dec_degrees())
        } else {
            let hint = request.hint.ok_or(SolveError::NoSolution)?;
            (hint.ra_hours() * 15.0, hint.dec_degrees())
        };
        Ok(SolveResult {
            orientation_deg: 0.0,
            ra_deg,
            dec_deg: (dec_deg + self.offset_arcsec / 3600.0).clamp(-90.0, 90.0),
            pixel_scale_arcsec_per_px: self.pixel_scale,
            success: true,
        })
    }
}

impl PlateSolver for SimulatedSolver {
    fn submit(&mut self, request: SolveRequest) -> Result<(), SolveError> {
        if self.pending.is_some() {
            return Err(SolveError::Busy);
        }
        lock(&self.submitted).push(request.clone());
        self.pending = Some((request, self.polls));
        Ok(())
    }

    fn poll(&mut self) -> Option<SolveCompletion> {
        let (request, left) = self.pending.take()?;
        if left > 0 {
            self.pending = Some((request, left - 1));
            return None;
        }
        let outcome = if self.pending_failures > 0 {
            self.pending_failures -= 1;
            Err(SolveError::NoSolution)
        } else {
            self.solve(&request)
        };
        Some(SolveCompletion {
            ticket: request.ticket,
            outcome,
        })
    }

    fn cancel(&mut self) {
        self.pending = None;
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::{angular_separation_deg, FixedClock, Frame, SkyCoordinate};
    use crate::solver::SearchHint;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap()))
    }

    #[test]
    fn simulated_frames_solve_to_true_pointing() {
        let start = SkyCoordinate::new(6.0, 30.0, Frame::Apparent).unwrap();
        let mut state = MountState::new(start);
        state.error_dec_deg = 0.25;
        let mount = Arc::new(Mutex::new(state));
        let clock = clock();
        let mut solver = SimulatedSolver::new(mount, clock.clone(), 1);
        solver
            .submit(SolveRequest {
                ticket: 9,
                image: PathBuf::from(SIM_FRAME_DIR).join("frame_0001.fits"),
                bounds: None,
                hint: None,
            })
            .unwrap();
        assert!(solver.poll().is_none());
        let completion = solver.poll().unwrap();
        assert_eq!(completion.ticket, 9);
        let result = completion.outcome.unwrap();
        let solved = SkyCoordinate::from_degrees(result.ra_deg, result.dec_deg, Frame::J2000)
            .unwrap()
            .to_apparent(clock.now());
        let expected = SkyCoordinate::new(6.0, 30.25, Frame::Apparent).unwrap();
        assert!(angular_separation_deg(&solved, &expected) * 3600.0 < 0.1);
    }

    #[test]
    fn foreign_images_solve_to_hint() {
        let mount = Arc::new(Mutex::new(MountState::new(
            SkyCoordinate::new(0.0, 0.0, Frame::Apparent).unwrap(),
        )));
        let mut solver = SimulatedSolver::new(mount, clock(), 0);
        let mut request = SolveRequest {
            ticket: 1,
            image: PathBuf::from("/data/m31.fits"),
            bounds: None,
            hint: Some(SearchHint::new(0.7, 41.2, 15.0).unwrap()),
        };
        solver.submit(request.clone()).unwrap();
        let result = solver.poll().unwrap().outcome.unwrap();
        assert!((result.ra_deg - 10.5).abs() < 1e-9);

        request.hint = None;
        solver.submit(request).unwrap();
        assert_eq!(solver.poll().unwrap().outcome, Err(SolveError::NoSolution));
    }
}
