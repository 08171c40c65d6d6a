use super::{output_path_for, ComputePlatform, PlatformError, Submission};
use crate::{
    config::{ConfigErrors, SlurmConfig},
    job::{Job, JobStatus},
    launch::{render_config, LaunchError, CONFIG_FILE, STDERR_FILE, STDOUT_FILE},
    logs::LogMap,
};
use itertools::Itertools;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt, fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

const SETUP_TEMPLATE: &str = include_str!("../../templates/setup.sh");
const SUBMISSION_TEMPLATE: &str = include_str!("../../templates/submission.sh");
const RESUME_TEMPLATE: &str = "cd \"$HYPERTRAINER_JOB_DIR\" && sbatch --parsable \"$HYPERTRAINER_NAME.sh\"";

// followed by the exit code of squeue, an empty active section only counts if squeue succeeded
const SACCT_SEPARATOR: &str = "--drover-sacct--";
const STATUS_QUERY: &str = "squeue -h -u \"$USER\" -o '%i %t'
echo \"--drover-sacct-- $?\"
sacct -n -X -P -o JobID,State,ExitCode -s CD,F,CA,DL,TO -S 010100 || exit $?
";

// output still arriving after ssh exited is awaited at least this long
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    fn check(self) -> Result<Self, PlatformError> {
        if self.success() {
            Ok(self)
        } else {
            Err(PlatformError::Remote {
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// A shell on the cluster login node, every call is one bounded round trip
pub trait RemoteShell: Send + Sync + fmt::Debug {
    /// feed `script` to a remote shell and collect its output
    fn run(&self, script: &str) -> Result<ShellOutput, PlatformError>;
}

#[derive(Debug, Clone)]
pub struct SshShell {
    destination: String,
    timeout: Duration,
}

impl SshShell {
    pub fn new(destination: impl Into<String>, timeout: Duration) -> Self {
        Self {
            destination: destination.into(),
            timeout,
        }
    }
}

/// Pipe reader whose output can be taken before the pipe is closed
struct Drain {
    output: Arc<Mutex<Vec<u8>>>,
    // disconnects once the pipe reached EOF
    done: Receiver<()>,
}

impl Drain {
    fn start<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let output = Arc::new(Mutex::new(Vec::new()));
        let (sender, done) = mpsc::channel::<()>();

        let buffer = output.clone();
        thread::spawn(move || {
            let _sender = sender;
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];

            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(read) => buffer.lock().extend_from_slice(&chunk[..read]),
                    Err(error) => {
                        debug!(error = ?error, "Failed to read shell output");
                        break;
                    }
                }
            }
        });

        Self { output, done }
    }

    /// Wait until `deadline` for EOF, a pipe kept open by a detached grandchild is abandoned
    fn finish(self, deadline: Instant) -> String {
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(DRAIN_GRACE);

        if let Err(mpsc::RecvTimeoutError::Timeout) = self.done.recv_timeout(remaining) {
            warn!("Shell output is still open after the shell exited, using what was read");
        }

        let output = self.output.lock();
        String::from_utf8_lossy(&output).into_owned()
    }
}

/// Feed `script` to `command` and collect its output, the whole round trip is bounded by `timeout`
pub(crate) fn run_bounded(
    mut command: Command,
    script: &str,
    timeout: Duration,
) -> Result<ShellOutput, PlatformError> {
    let deadline = Instant::now() + timeout;
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // all pipes are serviced concurrently, a full pipe must not stall the round trip
    let stdin = child.stdin.take();
    let script = script.to_owned();
    thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            if let Err(error) = stdin.write_all(script.as_bytes()) {
                debug!(error = ?error, "Failed to write the remote script");
            }
        }
    });
    let stdout = Drain::start(child.stdout.take());
    let stderr = Drain::start(child.stderr.take());

    match child.wait_timeout(timeout)? {
        Some(status) => Ok(ShellOutput {
            status: status.code(),
            stdout: stdout.finish(deadline),
            stderr: stderr.finish(deadline),
        }),
        None => {
            child.kill()?;
            child.wait()?;

            Err(PlatformError::Timeout {
                waiting_for: format!("{command:?}"),
                after: timeout,
            })
        }
    }
}

impl RemoteShell for SshShell {
    #[instrument(skip_all, fields(destination = %self.destination), level = "debug")]
    fn run(&self, script: &str) -> Result<ShellOutput, PlatformError> {
        let mut command = Command::new("ssh");
        command.args(["-o", "BatchMode=yes", &self.destination, "bash", "-s"]);

        let result = run_bounded(command, script, self.timeout);
        if let Err(PlatformError::Timeout { .. }) = &result {
            warn!(destination = %self.destination, "ssh timed out and was killed");
        }

        result
    }
}

/// Literal placeholder replacement, the submission body is inserted first so its placeholders are
/// replaced too, the config data is inserted last so it is never touched
pub fn replace_variables(
    template: &str,
    job: &Job,
    job_dir: &str,
    interpreter: &[String],
    config_data: &str,
    submission: &str,
) -> String {
    let interpreter = interpreter.iter().map(|word| quote(word)).join(" ");
    let key_value_map = [
        ("$HYPERTRAINER_SUBMISSION", submission.to_owned()),
        ("$HYPERTRAINER_INTERPRETER", interpreter),
        ("$HYPERTRAINER_NAME", job.name.clone()),
        ("$HYPERTRAINER_OUTFILE", format!("{job_dir}/{STDOUT_FILE}")),
        ("$HYPERTRAINER_ERRFILE", format!("{job_dir}/{STDERR_FILE}")),
        ("$HYPERTRAINER_JOB_DIR", job_dir.to_owned()),
        ("$HYPERTRAINER_SCRIPT", job.script.to_string_lossy().into_owned()),
        ("$HYPERTRAINER_CONFIGFILE", format!("{job_dir}/{CONFIG_FILE}")),
        ("$HYPERTRAINER_CONFIGDATA", config_data.to_owned()),
    ];

    key_value_map
        .iter()
        .fold(template.to_owned(), |output, (key, value)| output.replace(key, value))
}

/// single quote for a POSIX shell
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Slurm cluster reached over ssh
#[derive(Debug)]
pub struct SlurmPlatform {
    shell: Box<dyn RemoteShell>,
    remote_root: String,
    interpreter: Vec<String>,
    setup_template: String,
    submission_template: String,
}

impl SlurmPlatform {
    pub fn new(shell: impl RemoteShell + 'static, remote_root: impl Into<String>) -> Self {
        Self {
            shell: Box::new(shell),
            remote_root: remote_root.into(),
            interpreter: vec!["python".to_owned()],
            setup_template: SETUP_TEMPLATE.to_owned(),
            submission_template: SUBMISSION_TEMPLATE.to_owned(),
        }
    }

    pub fn from_config(config: &SlurmConfig) -> Result<Self, ConfigErrors> {
        let load = |path: &PathBuf| {
            fs::read_to_string(path).map_err(|source| ConfigErrors::Template {
                path: path.clone(),
                source,
            })
        };

        let mut platform = Self::new(
            SshShell::new(config.server.clone(), config.timeout()),
            config.remote_root.clone(),
        );
        if let Some(path) = &config.setup_template {
            platform.setup_template = load(path)?;
        }
        if let Some(path) = &config.submission_template {
            platform.submission_template = load(path)?;
        }

        Ok(platform.with_interpreter(config.interpreter.clone()))
    }

    /// command the batch script runs the training script with, empty to execute it directly
    pub fn with_interpreter(mut self, interpreter: Vec<String>) -> Self {
        self.interpreter = interpreter;
        self
    }

    fn job_dir(&self, job: &Job, resume: bool) -> Result<String, PlatformError> {
        let path = output_path_for(Path::new(&self.remote_root), job, resume)?;

        Ok(path.to_string_lossy().into_owned())
    }
}

impl ComputePlatform for SlurmPlatform {
    #[instrument(skip_all, fields(job = %job.uuid, resume = resume), level = "info")]
    fn submit(&self, job: &mut Job, resume: bool) -> Result<Submission, PlatformError> {
        let job_dir = self.job_dir(job, resume)?;

        let script = if resume {
            replace_variables(RESUME_TEMPLATE, job, &job_dir, &[], "", "")
        } else {
            let config_data = render_config(&job.config, Path::new(&job_dir)).map_err(LaunchError::from)?;
            replace_variables(
                &self.setup_template,
                job,
                &job_dir,
                &self.interpreter,
                &config_data,
                &self.submission_template,
            )
        };

        let output = self.shell.run(&script)?.check()?;
        job.output_path = Some(PathBuf::from(&job_dir));

        // --parsable prints `<id>` or `<id>;<cluster>`
        let handle = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .and_then(|line| line.split(';').next())
            .map(str::to_owned)
            .ok_or_else(|| PlatformError::Remote {
                status: output.status,
                stderr: format!("sbatch printed no job id: {}", output.stderr),
            })?;
        info!(handle = %handle, job_dir = %job_dir, "Submitted slurm job");

        Ok(Submission {
            handle,
            status: JobStatus::Waiting,
        })
    }

    fn cancel(&self, job: &Job) -> Result<Option<JobStatus>, PlatformError> {
        self.shell
            .run(&format!("scancel {}", quote(&job.handle)))?
            .check()?;
        info!(handle = %job.handle, "Requested scancel");

        Ok(None)
    }

    fn update_statuses(&self, jobs: &mut [Job]) -> Result<(), PlatformError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let output = self.shell.run(STATUS_QUERY)?.check()?;
        let Some((active, rest)) = output.stdout.split_once(SACCT_SEPARATOR) else {
            return Err(PlatformError::Remote {
                status: output.status,
                stderr: "status query output is missing the sacct section".to_owned(),
            });
        };
        let (squeue_status, completed) = rest.split_once('\n').unwrap_or((rest, ""));
        match squeue_status.trim().parse::<i32>() {
            Ok(0) => {}
            status => {
                // without the active jobs every running job would look lost
                return Err(PlatformError::Remote {
                    status: status.ok(),
                    stderr: format!("squeue failed: {}", output.stderr.trim()),
                });
            }
        }
        let active = parse_squeue(active);
        let completed = parse_sacct(completed);

        for job in jobs.iter_mut() {
            job.status = completed
                .get(&job.handle)
                .or_else(|| active.get(&job.handle))
                .copied()
                .unwrap_or(JobStatus::Lost);
        }

        Ok(())
    }

    fn fetch_logs(&self, job: &Job) -> Result<LogMap, PlatformError> {
        let Some(job_dir) = &job.output_path else {
            return Ok(LogMap::new());
        };

        let script = format!(
            "cd {} 2>/dev/null || exit 0\ntail -v -n +1 -- *.log *.txt 2>/dev/null\nexit 0\n",
            quote(&job_dir.to_string_lossy())
        );

        Ok(parse_tail(&self.shell.run(&script)?.check()?.stdout))
    }

    fn delete(&self, job: &Job) -> Result<(), PlatformError> {
        if let Some(job_dir) = &job.output_path {
            self.shell
                .run(&format!("rm -rf -- {}", quote(&job_dir.to_string_lossy())))?
                .check()?;
            info!(job_dir = ?job_dir, "Deleted remote job directory");
        }

        Ok(())
    }
}

/// `<id> <state code>` rows of `squeue -o '%i %t'`
pub(crate) fn parse_squeue(output: &str) -> HashMap<String, JobStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let (id, code) = (columns.next()?, columns.next()?);

            let status = match code {
                // pending, configuring, requeued or held
                "PD" | "CF" | "RQ" | "RF" | "RH" | "RD" => JobStatus::Waiting,
                // resizing, suspended, stopped or signaled jobs keep their allocation
                "R" | "CG" | "RS" | "S" | "ST" | "SI" | "SO" => JobStatus::Running,
                "CD" => JobStatus::Finished,
                "F" => JobStatus::Crashed,
                "CA" => JobStatus::Cancelled,
                "DL" | "TO" => JobStatus::Removed,
                other => {
                    debug!(id = id, code = other, "Unmapped squeue state");
                    JobStatus::Unknown
                }
            };

            Some((id.to_owned(), status))
        })
        .collect()
}

/// `<id>|<state>|<exit code>:<signal>` rows of `sacct -P`, job steps are skipped
pub(crate) fn parse_sacct(output: &str) -> HashMap<String, JobStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.trim().split('|');
            let (id, state, exit_code) = (columns.next()?, columns.next()?, columns.next()?);

            if id.is_empty() || id.contains('.') {
                return None;
            }

            // `CANCELLED by 1000`, `OUT_OF_MEMORY+`
            let state = state
                .split(|c: char| c == '+' || c == '(' || c.is_whitespace())
                .next()
                .unwrap_or(state)
                .to_ascii_uppercase();
            let exit_code = exit_code.split(':').next().and_then(|code| code.trim().parse::<i32>().ok());

            let status = match state.as_str() {
                "COMPLETED" if exit_code == Some(0) => JobStatus::Finished,
                "CANCELLED" => JobStatus::Cancelled,
                "DEADLINE" | "TIMEOUT" => JobStatus::Removed,
                _ => JobStatus::Crashed,
            };

            Some((id.to_owned(), status))
        })
        .collect()
}

/// split `tail -v` output on its `==> file <==` headers, logs are keyed by file stem
pub(crate) fn parse_tail(output: &str) -> LogMap {
    let mut logs = LogMap::new();
    let mut current: Option<(String, String)> = None;

    for line in output.split_inclusive('\n') {
        let header = line
            .trim_end()
            .strip_prefix("==> ")
            .and_then(|rest| rest.strip_suffix(" <=="));

        match header {
            Some(file) => {
                if let Some((name, mut body)) = current.take() {
                    // tail separates files with an empty line
                    if body.ends_with('\n') {
                        body.pop();
                    }
                    logs.insert(name, body);
                }

                let stem = Path::new(file)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.to_owned());
                current = Some((stem, String::new()));
            }
            None => {
                if let Some((_, body)) = current.as_mut() {
                    body.push_str(line);
                }
            }
        }
    }

    if let Some((name, body)) = current {
        logs.insert(name, body);
    }

    logs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Backend, JobRequest};
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc};

    #[derive(Debug, Default, Clone)]
    struct FakeShell {
        scripts: Arc<Mutex<Vec<String>>>,
        replies: Arc<Mutex<VecDeque<ShellOutput>>>,
    }

    impl FakeShell {
        fn reply(&self, status: i32, stdout: &str, stderr: &str) {
            self.replies.lock().push_back(ShellOutput {
                status: Some(status),
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
            });
        }
    }

    impl RemoteShell for FakeShell {
        fn run(&self, script: &str) -> Result<ShellOutput, PlatformError> {
            self.scripts.lock().push(script.to_owned());
            self.replies.lock().pop_front().ok_or(PlatformError::Timeout {
                waiting_for: "fake shell".into(),
                after: Duration::ZERO,
            })
        }
    }

    fn job(name: &str) -> Job {
        Job::new(JobRequest {
            name: name.into(),
            backend: Backend::SlurmA,
            script: "/home/me/train.py".into(),
            config: serde_yaml::from_str("note: uses $HYPERTRAINER_NAME literally\n").unwrap(),
        })
    }

    #[test]
    fn placeholders_are_replaced_in_order() {
        let job = job("run1");
        let rendered = replace_variables(
            "$HYPERTRAINER_SUBMISSION|$HYPERTRAINER_CONFIGDATA",
            &job,
            "/r/x",
            &["srun".into(), "python3".into()],
            "name: $HYPERTRAINER_NAME",
            "#SBATCH -J $HYPERTRAINER_NAME -o $HYPERTRAINER_OUTFILE\n$HYPERTRAINER_INTERPRETER $HYPERTRAINER_SCRIPT $HYPERTRAINER_CONFIGFILE",
        );

        assert_eq!(
            rendered,
            "#SBATCH -J run1 -o /r/x/out.txt\n'srun' 'python3' /home/me/train.py /r/x/config.yaml|name: $HYPERTRAINER_NAME"
        );
    }

    #[test]
    fn submission_renders_the_bundled_templates() {
        let shell = FakeShell::default();
        shell.reply(0, "4242;cluster\n", "");
        let platform = SlurmPlatform::new(shell.clone(), "/home/me/drover");
        let mut job = job("run1");

        let submission = platform.submit(&mut job, false).unwrap();
        let job_dir = format!("/home/me/drover/{}", job.uuid);

        assert_eq!(
            submission,
            Submission {
                handle: "4242".into(),
                status: JobStatus::Waiting
            }
        );
        assert_eq!(job.output_path, Some(PathBuf::from(&job_dir)));

        let script = shell.scripts.lock()[0].clone();
        assert!(script.contains(&format!("mkdir \"{job_dir}\"")));
        assert!(script.contains("#SBATCH --job-name=run1"));
        assert!(script.contains(&format!("#SBATCH --output={job_dir}/out.txt")));
        assert!(script.contains("'python' \"/home/me/train.py\""));
        assert!(script.contains(&format!("output_path: {job_dir}")));
        // config data is inserted verbatim
        assert!(script.contains("uses $HYPERTRAINER_NAME literally"));
        assert!(script.ends_with("sbatch --parsable \"run1.sh\"\n"));
    }

    #[test]
    fn resume_resubmits_the_existing_script() {
        let shell = FakeShell::default();
        shell.reply(0, "77\n", "");
        let platform = SlurmPlatform::new(shell.clone(), "/home/me/drover");
        let mut job = job("run1");
        job.output_path = Some(PathBuf::from("/home/me/drover/old"));

        assert_eq!(platform.submit(&mut job, true).unwrap().handle, "77");
        assert_eq!(
            shell.scripts.lock()[0],
            "cd \"/home/me/drover/old\" && sbatch --parsable \"run1.sh\""
        );
    }

    #[test]
    fn remote_failures_are_hard_errors() {
        let shell = FakeShell::default();
        shell.reply(1, "", "mkdir: cannot create directory: File exists\n");
        let platform = SlurmPlatform::new(shell, "/r");
        let mut job = job("run1");

        match platform.submit(&mut job, false) {
            Err(PlatformError::Remote { status, stderr }) => {
                assert_eq!(status, Some(1));
                assert!(stderr.contains("File exists"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(job.output_path, None);
    }

    #[test]
    fn statuses_come_from_squeue_and_sacct() {
        let shell = FakeShell::default();
        shell.reply(
            0,
            "1 R\n5 PD\n9 CG\n10 CF\n11 S\n12 RQ\n--drover-sacct-- 0\n2|COMPLETED|0:0\n2.batch|COMPLETED|0:0\n\
             3|FAILED|1:0\n6|CANCELLED by 1000|0:15\n7|TIMEOUT|0:0\n8|COMPLETED|2:0\n",
            "",
        );
        let platform = SlurmPlatform::new(shell.clone(), "/r");

        let mut jobs: Vec<Job> = ["1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12"]
            .into_iter()
            .map(|handle| {
                let mut job = job(handle);
                job.handle = handle.into();
                job
            })
            .collect();

        platform.update_statuses(&mut jobs).unwrap();

        let statuses: Vec<_> = jobs.iter().map(|job| job.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Running,
                JobStatus::Finished,
                JobStatus::Crashed,
                JobStatus::Lost,
                JobStatus::Waiting,
                JobStatus::Cancelled,
                JobStatus::Removed,
                JobStatus::Crashed,
                JobStatus::Running,
                JobStatus::Waiting,
                JobStatus::Running,
                JobStatus::Waiting,
            ]
        );
        // one round trip for the whole batch
        assert_eq!(shell.scripts.lock().len(), 1);

        platform.update_statuses(&mut []).unwrap();
        assert_eq!(shell.scripts.lock().len(), 1);
    }

    #[test]
    fn failed_status_query_keeps_statuses() {
        let shell = FakeShell::default();
        shell.reply(255, "", "ssh: connect to host cluster port 22: Connection refused\n");
        let platform = SlurmPlatform::new(shell, "/r");
        let mut jobs = vec![job("a")];
        jobs[0].handle = "1".into();
        jobs[0].status = JobStatus::Running;

        assert!(matches!(
            platform.update_statuses(&mut jobs),
            Err(PlatformError::Remote { .. })
        ));
        assert_eq!(jobs[0].status, JobStatus::Running);
    }

    #[test]
    fn failed_squeue_keeps_statuses() {
        let shell = FakeShell::default();
        // squeue could not reach the controller, sacct still answered
        shell.reply(
            0,
            "--drover-sacct-- 1\n",
            "slurm_load_jobs error: Unable to contact slurm controller\n",
        );
        let platform = SlurmPlatform::new(shell, "/r");
        let mut jobs = vec![job("a")];
        jobs[0].handle = "1".into();
        jobs[0].status = JobStatus::Running;

        match platform.update_statuses(&mut jobs) {
            Err(PlatformError::Remote { status, stderr }) => {
                assert_eq!(status, Some(1));
                assert!(stderr.contains("Unable to contact"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(jobs[0].status, JobStatus::Running);
    }

    #[test]
    fn status_query_reports_the_squeue_exit_code() {
        let output = run_bounded(
            Command::new("sh"),
            &STATUS_QUERY
                .replace("squeue -h", "false")
                .replace("sacct -n", "true"),
            Duration::from_secs(10),
        )
        .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "--drover-sacct-- 1\n");
    }

    #[test]
    fn shell_round_trips_are_bounded() {
        // the grandchild keeps stdout open long after the shell itself exited
        let start = Instant::now();
        let output = run_bounded(
            Command::new("sh"),
            "(sleep 30 &)\necho 4242\n",
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(output.status, Some(0));
        assert_eq!(output.stdout, "4242\n");

        let start = Instant::now();
        assert!(matches!(
            run_bounded(Command::new("sh"), "sleep 30\n", Duration::from_millis(200)),
            Err(PlatformError::Timeout { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn tail_output_is_split_per_file() {
        let logs = parse_tail(
            "==> err.txt <==\n\n==> out.txt <==\nepoch 1\nepoch 2\n\n==> progress.log <==\n0 trn 0 10 1.5\n",
        );

        assert_eq!(logs.len(), 3);
        assert_eq!(logs["err"], "");
        assert_eq!(logs["out"], "epoch 1\nepoch 2\n");
        assert_eq!(logs["progress"], "0 trn 0 10 1.5\n");
        assert!(parse_tail("").is_empty());
    }

    #[test]
    fn cancel_and_delete_quote_their_arguments() {
        let shell = FakeShell::default();
        shell.reply(0, "", "");
        shell.reply(0, "", "");
        let platform = SlurmPlatform::new(shell.clone(), "/r");
        let mut job = job("a");
        job.handle = "12".into();
        job.output_path = Some(PathBuf::from("/r/it's"));

        assert_eq!(platform.cancel(&job).unwrap(), None);
        platform.delete(&job).unwrap();

        let scripts = shell.scripts.lock();
        assert_eq!(scripts[0], "scancel '12'");
        assert_eq!(scripts[1], r"rm -rf -- '/r/it'\''s'");
    }
}
