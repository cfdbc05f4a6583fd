use std::{
    fs::{self, OpenOptions},
    io,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Instant,
};

use super::{
    args::{build_args, parse_solution, SolverOptions},
    error::SolveError,
    types::{SolveCompletion, SolveRequest},
    PlateSolver,
};

/// Runs `solve-field` as a child process and polls it for completion.
pub struct AstrometrySolver {
    options: SolverOptions,
    running: Option<RunningSolve>,
    runs: usize,
}

struct RunningSolve {
    ticket: u64,
    child: Child,
    started: Instant,
    stdout_path: PathBuf,
}

impl AstrometrySolver {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            running: None,
            runs: 0,
        }
    }

    fn spawn(&mut self, request: &SolveRequest) -> Result<RunningSolve, SolveError> {
        if !request.image.exists() {
            return Err(SolveError::MalformedImage(format!(
                "{} does not exist",
                request.image.display()
            )));
        }
        fs::create_dir_all(&self.options.work_dir)?;

        self.runs += 1;
        let stdout_path = self
            .options
            .work_dir
            .join(format!("solve_{:03}_stdout.log", self.runs));
        let stderr_path = self
            .options
            .work_dir
            .join(format!("solve_{:03}_stderr.log", self.runs));

        let stdout_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&stdout_path)?;

        let stderr_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&stderr_path)?;

        let args = build_args(&self.options, request);
        log::info!(
            "Starting solver: {} {}",
            self.options.binary.display(),
            args.join(" ")
        );

        let child = Command::new(&self.options.binary)
            .args(&args)
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    SolveError::EngineUnavailable(format!(
                        "{}: {}",
                        self.options.binary.display(),
                        e
                    ))
                }
                _ => SolveError::from(e),
            })?;

        log::debug!("Solver spawned (PID: {:?})", child.id());

        Ok(RunningSolve {
            ticket: request.ticket,
            child,
            started: Instant::now(),
            stdout_path,
        })
    }
}

impl PlateSolver for AstrometrySolver {
    fn submit(&mut self, request: SolveRequest) -> Result<(), SolveError> {
        if self.running.is_some() {
            return Err(SolveError::Busy);
        }
        let running = self.spawn(&request)?;
        self.running = Some(running);
        Ok(())
    }

    fn poll(&mut self) -> Option<SolveCompletion> {
        let running = self.running.as_mut()?;
        let ticket = running.ticket;

        let outcome = match running.child.try_wait() {
            Ok(Some(status)) => {
                log::info!("Solver exited with {}", status);
                let log = fs::read_to_string(&running.stdout_path).unwrap_or_default();
                match parse_solution(&log) {
                    Some(result) if status.success() => Ok(result),
                    _ => Err(SolveError::NoSolution),
                }
            }
            Ok(None) => {
                if running.started.elapsed() < self.options.timeout {
                    return None;
                }
                log::warn!("Solver exceeded {:?}, killing it", self.options.timeout);
                let _ = running.child.kill();
                let _ = running.child.wait();
                Err(SolveError::Timeout(self.options.timeout))
            }
            Err(e) => {
                log::error!("Solver wait error: {}", e);
                Err(SolveError::from(e))
            }
        };

        self.running = None;
        Some(SolveCompletion { ticket, outcome })
    }

    fn cancel(&mut self) {
        if let Some(mut running) = self.running.take() {
            log::info!("Cancelling solver (PID: {:?})", running.child.id());
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }

    fn is_busy(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for AstrometrySolver {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(image: PathBuf) -> SolveRequest {
        SolveRequest {
            ticket: 3,
            image,
            bounds: None,
            hint: None,
        }
    }

    #[test]
    fn missing_engine_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("frame.fits");
        fs::write(&image, b"").unwrap();
        let mut solver = AstrometrySolver::new(SolverOptions {
            binary: PathBuf::from("/nonexistent/solve-field"),
            work_dir: dir.path().join("work"),
            ..Default::default()
        });
        let err = solver.submit(request(image)).unwrap_err();
        assert!(matches!(err, SolveError::EngineUnavailable(_)), "{err:?}");
        assert!(!solver.is_busy());
    }

    #[test]
    fn missing_image_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut solver = AstrometrySolver::new(SolverOptions {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let err = solver.submit(request(dir.path().join("absent.fits"))).unwrap_err();
        assert!(matches!(err, SolveError::MalformedImage(_)));
    }

    #[cfg(unix)]
    #[test]
    fn parses_output_of_finished_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("frame.fits");
        fs::write(&image, b"").unwrap();
        let script = dir.path().join("fake-solve-field");
        fs::write(
            &script,
            "#!/bin/sh\necho 'Field center: (RA,Dec) = (10.5, 41.25) deg.'\necho '  pixel scale 2.0 arcsec/pix.'\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut solver = AstrometrySolver::new(SolverOptions {
            binary: script,
            work_dir: dir.path().join("work"),
            ..Default::default()
        });
        solver.submit(request(image.clone())).unwrap();
        assert_eq!(solver.submit(request(image)), Err(SolveError::Busy));

        let deadline = Instant::now() + Duration::from_secs(10);
        let completion = loop {
            if let Some(c) = solver.poll() {
                break c;
            }
            assert!(Instant::now() < deadline, "solver never finished");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(completion.ticket, 3);
        let result = completion.outcome.unwrap();
        assert!((result.ra_deg - 10.5).abs() < 1e-9);
        assert!((result.pixel_scale_arcsec_per_px - 2.0).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[test]
    fn kills_process_after_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("frame.fits");
        fs::write(&image, b"").unwrap();
        let script = dir.path().join("slow-solve-field");
        fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut solver = AstrometrySolver::new(SolverOptions {
            binary: script,
            work_dir: dir.path().join("work"),
            timeout: Duration::from_millis(50),
            ..Default::default()
        });
        solver.submit(request(image)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let completion = solver.poll().unwrap();
        assert!(matches!(completion.outcome, Err(SolveError::Timeout(_))));
        assert!(!solver.is_busy());
    }
}
