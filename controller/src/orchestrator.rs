//! Ejecución de un plan: decide los hosts de cada paso según su modo, lo
//! lanza secuencial o concurrentemente y anota el resultado por host.

use std::collections::HashSet;
use std::sync::Arc;

use common::{Host, HostRole};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::actions;
use crate::plan::{ExecMode, Plan, Selector, Step};
use crate::report::{RunReport, StepOutcome};
use crate::state::Session;

const BLOCKED: &str = "un paso requerido anterior falló en este host";
const ABORTED: &str = "ejecución abortada tras un fallo";

pub struct Orchestrator {
    session: Arc<Session>,
}

impl Orchestrator {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Hosts que participan en un paso, en orden estable.
    pub fn participants(&self, mode: ExecMode) -> Vec<Host> {
        let topology = &self.session.topology;
        let targets = self.session.targets();
        match mode {
            ExecMode::Once(role) => topology
                .first_with(role)
                .map(|h| vec![h.to_string()])
                .unwrap_or_default(),
            ExecMode::All(sel) | ExecMode::Parallel(sel) => match sel {
                Selector::AllHosts => targets.to_vec(),
                Selector::Role(role) => targets
                    .iter()
                    .filter(|h| topology.has_role(h, role))
                    .cloned()
                    .collect(),
                Selector::Quorum => topology
                    .quorum()
                    .into_iter()
                    .filter(|h| targets.contains(h))
                    .collect(),
            },
        }
    }

    pub async fn execute(&self, plan: &Plan) -> RunReport {
        let mut report = RunReport::start(plan.operation);
        let mut blocked: HashSet<Host> = HashSet::new();
        let abort_on_failure = self.session.settings.execution.abort_on_first_failure;

        for (idx, step) in plan.steps.iter().enumerate() {
            let hosts = self.participants(step.mode);
            if hosts.is_empty() {
                let reason = match step.mode {
                    ExecMode::Once(role) => no_holder(role),
                    _ => "ningún host objetivo cumple el selector".to_string(),
                };
                info!("paso '{}' sin hosts: {}", step.name, reason);
                report.record(&step.name, "-", StepOutcome::Skipped(reason));
                continue;
            }

            let (runnable, held): (Vec<Host>, Vec<Host>) =
                hosts.into_iter().partition(|h| !blocked.contains(h));
            for h in &held {
                report.record(&step.name, h, StepOutcome::Skipped(BLOCKED.to_string()));
            }
            info!("paso '{}' [{}] en {:?}", step.name, step.mode, runnable);

            let outcomes = match step.mode {
                ExecMode::Parallel(_) => self.run_parallel(step, &runnable).await,
                _ => self.run_sequential(step, &runnable, abort_on_failure).await,
            };

            let mut failed = false;
            for (host, outcome) in outcomes {
                if let StepOutcome::Failed(reason) = &outcome {
                    warn!("[{}] paso '{}' falló: {}", host, step.name, reason);
                    failed = true;
                    if step.required {
                        blocked.insert(host.clone());
                    }
                }
                report.record(&step.name, &host, outcome);
            }

            if failed && abort_on_failure {
                error!("abortando '{}' tras el fallo en '{}'", plan.operation, step.name);
                for rest in &plan.steps[idx + 1..] {
                    report.record(&rest.name, "-", StepOutcome::Skipped(ABORTED.to_string()));
                }
                break;
            }
        }

        report.finish();
        report
    }

    async fn run_sequential(
        &self,
        step: &Step,
        hosts: &[Host],
        stop_on_failure: bool,
    ) -> Vec<(Host, StepOutcome)> {
        let mut outcomes = Vec::with_capacity(hosts.len());
        let mut stopped = false;
        for host in hosts {
            if stopped {
                outcomes.push((host.clone(), StepOutcome::Skipped(ABORTED.to_string())));
                continue;
            }
            let outcome = match actions::perform(&self.session, host, &step.action).await {
                Ok(()) => StepOutcome::Ok,
                Err(e) => StepOutcome::Failed(format!("{:#}", e)),
            };
            stopped = stop_on_failure && matches!(outcome, StepOutcome::Failed(_));
            outcomes.push((host.clone(), outcome));
        }
        outcomes
    }

    /// Una tarea por host; se esperan todas antes de volver.
    async fn run_parallel(&self, step: &Step, hosts: &[Host]) -> Vec<(Host, StepOutcome)> {
        let mut set = JoinSet::new();
        for host in hosts {
            let session = self.session.clone();
            let action = step.action.clone();
            let host = host.clone();
            set.spawn(async move {
                let outcome = match actions::perform(&session, &host, &action).await {
                    Ok(()) => StepOutcome::Ok,
                    Err(e) => StepOutcome::Failed(format!("{:#}", e)),
                };
                (host, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(hosts.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(e) => error!("tarea del paso '{}' abortada: {}", step.name, e),
            }
        }

        // una tarea que entra en pánico no devuelve su host
        for host in hosts {
            if !outcomes.iter().any(|(h, _)| h == host) {
                outcomes.push((
                    host.clone(),
                    StepOutcome::Failed("la tarea terminó sin resultado".to_string()),
                ));
            }
        }
        outcomes.sort_by_key(|(h, _)| hosts.iter().position(|x| x == h));
        outcomes
    }
}

fn no_holder(role: HostRole) -> String {
    format!("ningún host tiene el rol {}", role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{self, Action, Operation};
    use crate::sites::SiteProperties;
    use async_trait::async_trait;
    use common::settings::Settings;
    use common::{ClusterTopology, CommandOutput, RemoteCommand, RemoteError, RemoteShell};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Shell falso: anota cada comando y responde según unas reglas mínimas.
    #[derive(Default)]
    struct RecordingShell {
        calls: Mutex<Vec<(String, String)>>,
        uploads: Mutex<Vec<(String, String)>>,
        /// (host, fragmento) que termina con estado 1.
        failing: Vec<(String, String)>,
    }

    impl RecordingShell {
        fn failing_on(host: &str, fragment: &str) -> Self {
            Self {
                failing: vec![(host.to_string(), fragment.to_string())],
                ..Self::default()
            }
        }

        fn scripts_on(&self, host: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, s)| s.clone())
                .collect()
        }

        fn count_on(&self, host: &str, fragment: &str) -> usize {
            self.scripts_on(host).iter().filter(|s| s.contains(fragment)).count()
        }

        fn uploads_to(&self, host: &str) -> usize {
            self.uploads.lock().unwrap().iter().filter(|(h, _)| h == host).count()
        }
    }

    #[async_trait]
    impl RemoteShell for RecordingShell {
        async fn exec(&self, host: &str, cmd: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push((host.to_string(), cmd.script.clone()));

            let fails = self
                .failing
                .iter()
                .any(|(h, frag)| h == host && cmd.script.contains(frag.as_str()));
            let mut out = CommandOutput::default();
            if fails || cmd.script.starts_with("sha256sum") {
                out.status = 1;
            } else if cmd.script.contains("addr show") {
                let n = match host {
                    "a" => 1,
                    "b" => 2,
                    _ => 3,
                };
                out.stdout = format!("10.0.0.{}\n", n);
            } else if cmd.script.contains("id_rsa.pub") {
                out.stdout = format!("ssh-rsa AAAA {}\n", host);
            }
            Ok(out)
        }

        async fn upload(&self, host: &str, _local: &Path, remote_path: &str) -> Result<(), RemoteError> {
            self.uploads
                .lock()
                .unwrap()
                .push((host.to_string(), remote_path.to_string()));
            Ok(())
        }
    }

    /// coordinator a, workers [b, c]
    fn topology() -> ClusterTopology {
        let mut settings = Settings::default();
        settings.hosts.coordinator = Some("a".to_string());
        settings.hosts.workers = vec!["b".to_string(), "c".to_string()];
        common::resolve_static(&settings).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        shell: Arc<RecordingShell>,
        orchestrator: Orchestrator,
        session: Arc<Session>,
    }

    fn fixture_with(shell: RecordingShell, settings: Settings, subset: &[String]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let helper: PathBuf = dir.path().join("propmerge");
        let wrapper: PathBuf = dir.path().join("run-in-env.sh");
        std::fs::write(&helper, b"helper").unwrap();
        std::fs::write(&wrapper, b"#!/bin/sh\n. \"$1\"; shift; exec \"$@\"\n").unwrap();

        let shell = Arc::new(shell);
        let topology = Arc::new(topology());
        let sites = SiteProperties::derive(&topology, &settings);
        let session = Session::new(
            shell.clone(),
            topology,
            Arc::new(settings),
            sites,
            helper,
            wrapper,
        )
        .restrict_to(subset)
        .unwrap();
        let session = Arc::new(session);
        Fixture {
            _dir: dir,
            shell,
            orchestrator: Orchestrator::new(session.clone()),
            session,
        }
    }

    fn autoloaded() -> Settings {
        let mut s = Settings::default();
        s.paths.env_file_autoloaded = true;
        s
    }

    fn fixture(shell: RecordingShell) -> Fixture {
        fixture_with(shell, autoloaded(), &[])
    }

    async fn run(f: &Fixture, op: Operation) -> RunReport {
        let plan = plan::build(op, &f.session.settings, &f.session.topology);
        f.orchestrator.execute(&plan).await
    }

    #[tokio::test]
    async fn start_places_daemons_by_role() {
        let f = fixture(RecordingShell::default());
        let report = run(&f, Operation::Start).await;
        assert_eq!(report.exit_code(), 0);

        let s = &f.shell;
        assert_eq!(s.count_on("a", "start namenode"), 1);
        assert_eq!(s.count_on("a", "start datanode"), 0);
        assert_eq!(s.count_on("b", "start datanode"), 1);
        assert_eq!(s.count_on("c", "start datanode"), 1);
        // standby en el primary worker, nunca en el secondary
        assert_eq!(s.count_on("b", "start namenode"), 1);
        assert_eq!(s.count_on("c", "start namenode"), 0);
        for h in ["a", "b", "c"] {
            assert_eq!(s.count_on(h, "start journalnode"), 1);
        }
        assert_eq!(s.count_on("b", "start historyserver"), 1);
        assert_eq!(report.ok_hosts("start datanode"), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn once_steps_ignore_the_target_subset() {
        let f = fixture_with(RecordingShell::default(), autoloaded(), &["c".to_string()]);
        run(&f, Operation::Start).await;

        assert_eq!(f.shell.count_on("a", "start namenode"), 1);
        assert_eq!(f.shell.count_on("b", "start datanode"), 0);
        assert_eq!(f.shell.count_on("c", "start datanode"), 1);
        assert_eq!(f.shell.count_on("a", "start journalnode"), 0);
    }

    #[tokio::test]
    async fn failed_required_step_skips_later_steps_on_that_host_only() {
        let f = fixture(RecordingShell::failing_on("a", "namenode -format"));
        let report = run(&f, Operation::Format).await;

        assert_eq!(report.exit_code(), 1);
        assert_eq!(f.shell.count_on("a", "start namenode"), 0);
        assert_eq!(f.shell.count_on("a", "zkfc -formatZK"), 0);
        assert_eq!(f.shell.count_on("b", "namenode -bootstrapStandby"), 1);
        assert_eq!(f.shell.count_on("b", "start namenode"), 1);

        let skipped: Vec<_> = report
            .records
            .iter()
            .filter(|r| r.host == "a" && matches!(r.outcome, StepOutcome::Skipped(_)))
            .collect();
        assert_eq!(skipped.len(), 2);
    }

    #[tokio::test]
    async fn plain_failures_do_not_stop_the_run() {
        let f = fixture(RecordingShell::failing_on("b", "start datanode"));
        let report = run(&f, Operation::Start).await;

        assert_eq!(report.exit_code(), 1);
        assert_eq!(f.shell.count_on("c", "start datanode"), 1);
        assert_eq!(f.shell.count_on("b", "start nodemanager"), 1);
    }

    #[tokio::test]
    async fn abort_option_stops_at_first_failure() {
        let mut settings = autoloaded();
        settings.execution.abort_on_first_failure = true;
        let f = fixture_with(RecordingShell::failing_on("b", "start journalnode"), settings, &[]);
        let report = run(&f, Operation::Start).await;

        assert_eq!(f.shell.count_on("a", "start namenode"), 0);
        let last = report.records.last().unwrap();
        assert_eq!(last.outcome, StepOutcome::Skipped(ABORTED.to_string()));
    }

    #[tokio::test]
    async fn stop_reaches_quorum_and_force_kills_jvms() {
        let f = fixture(RecordingShell::default());
        run(&f, Operation::Stop { force: true }).await;
        for h in ["a", "b", "c"] {
            assert_eq!(f.shell.count_on(h, "zkServer.sh stop"), 1);
            assert_eq!(f.shell.count_on(h, "xargs -L1 -r kill"), 1);
        }
        let scripts = f.shell.scripts_on("a");
        let nn = scripts.iter().position(|s| s.contains("stop namenode")).unwrap();
        let jn = scripts.iter().position(|s| s.contains("stop journalnode")).unwrap();
        assert!(nn < jn);
    }

    #[tokio::test]
    async fn daemons_run_through_env_wrapper_when_not_autoloaded() {
        let f = fixture_with(RecordingShell::default(), Settings::default(), &[]);
        run(&f, Operation::Start).await;

        let nn = f
            .shell
            .scripts_on("a")
            .into_iter()
            .find(|s| s.contains("start namenode"))
            .unwrap();
        assert!(nn.contains("/home/ubuntu/.hafab/bin/run-in-env.sh /home/ubuntu/hadoop2_env.sh "));
        assert!(nn.starts_with("cd /home/ubuntu/Programs/hadoop-2.8.5 && "));
        // el shell falso nunca confirma el digest, así que sube en cada paso
        assert!(f.shell.uploads_to("a") >= 1);
    }

    #[tokio::test]
    async fn address_propagation_updates_every_host_and_writes_inventory() {
        let f = fixture(RecordingShell::default());
        let plan = Plan {
            operation: Operation::Bootstrap,
            steps: plan::propagation_steps(),
        };
        let report = f.orchestrator.execute(&plan).await;
        assert_eq!(report.exit_code(), 0);

        for h in ["a", "b", "c"] {
            let update = f
                .shell
                .scripts_on(h)
                .into_iter()
                .find(|s| s.contains("--format hosts"))
                .unwrap();
            assert!(update.contains("--format hosts /etc/hosts 10.0.0.1 a 10.0.0.2 b 10.0.0.3 c"));
        }
        assert_eq!(
            f.shell.count_on("a", "printf '%s\\n' 10.0.0.1 10.0.0.2 10.0.0.3 > /home/ubuntu/privateIps"),
            1
        );
        assert_eq!(f.shell.count_on("b", "/home/ubuntu/privateIps"), 0);
    }

    #[tokio::test]
    async fn failed_helper_upload_skips_site_writes_on_that_host() {
        let f = fixture(RecordingShell::failing_on("b", "mkdir -p /home/ubuntu/.hafab/bin"));
        let report = run(&f, Operation::Configure).await;

        assert_eq!(report.exit_code(), 1);
        assert_eq!(f.shell.count_on("b", "core-site.xml"), 0);
        assert!(f.shell.count_on("a", "core-site.xml") > 0);
        assert_eq!(report.ok_hosts("myid"), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn missing_role_is_reported_as_skipped() {
        let plan = Plan {
            operation: Operation::Start,
            steps: vec![Step::new(
                "nada",
                ExecMode::All(Selector::Role(HostRole::Worker)),
                Action::Shell {
                    script: "true".to_string(),
                    elevated: false,
                },
            )],
        };
        let f = fixture_with(RecordingShell::default(), autoloaded(), &["a".to_string()]);
        let report = f.orchestrator.execute(&plan).await;
        assert_eq!(report.records.len(), 1);
        assert!(matches!(report.records[0].outcome, StepOutcome::Skipped(_)));
        assert!(f.shell.scripts_on("a").is_empty());
    }

    #[tokio::test]
    async fn configure_writes_myid_per_quorum_member() {
        let f = fixture(RecordingShell::default());
        run(&f, Operation::Configure).await;
        assert_eq!(f.shell.count_on("a", "echo 1 > /HA/data/zookeeper/myid"), 1);
        assert_eq!(f.shell.count_on("b", "echo 2 > /HA/data/zookeeper/myid"), 1);
        assert_eq!(f.shell.count_on("c", "echo 3 > /HA/data/zookeeper/myid"), 1);
        assert_eq!(f.shell.count_on("b", "core-site.xml"), f.shell.count_on("a", "core-site.xml"));
    }
}
