use std::{
    env,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use daphne_test_utils::{CaseFiles, CheckReport, Harness, HarnessConfig, Invocation, SetupError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    // Loaded before entering the workspace: a relative --config is taken from
    // the caller's working directory.
    let harness = match &cli.config {
        Some(path) => Harness::new(HarnessConfig::load(path)?),
        None => Harness::from_env()?,
    };
    let workspace = fs::canonicalize(&cli.workspace)
        .with_context(|| format!("failed to resolve workspace {}", cli.workspace.display()))?;
    // Scripts, references and the DAPHNE binary are addressed relative to the
    // workspace, and children inherit our working directory.
    env::set_current_dir(&workspace)
        .with_context(|| format!("failed to enter workspace {}", workspace.display()))?;

    let manifest = load_manifest(&cli.suite)?;

    match cli.action {
        Action::Run => run_suite(&manifest, &cli.suite, &harness, &workspace),
        Action::List => list_suite(&manifest),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "daphne-test-harness",
    version,
    about = "Runs DAPHNE command line test suites and compares their output"
)]
struct Cli {
    /// Suite manifest (TOML), relative to the workspace.
    suite: PathBuf,
    #[arg(value_enum, default_value = "run")]
    action: Action,
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Harness config (TOML), relative to the current directory; defaults to
    /// $DAPHNE_HARNESS_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Action {
    Run,
    List,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: Option<String>,
    description: Option<String>,
    build_script: Option<String>,
    /// Prefix of every case's files, e.g. `test/api/cli/scripts/`.
    #[serde(default)]
    dir: String,
    #[serde(default)]
    cases: Vec<TestCase>,
}

#[derive(Debug, Deserialize, Clone)]
struct TestCase {
    name: String,
    description: Option<String>,
    idx: u32,
    #[serde(default)]
    check: CheckKind,
    expected_status: Option<i32>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    allow_failure: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum CheckKind {
    #[default]
    SomeRef,
    Ref,
    SelfRef,
    DaphneLib,
    DaphneLibScalar,
    Fails,
    Status,
}

impl CheckKind {
    fn as_str(&self) -> &'static str {
        match self {
            CheckKind::SomeRef => "some-ref",
            CheckKind::Ref => "ref",
            CheckKind::SelfRef => "self-ref",
            CheckKind::DaphneLib => "daphne-lib",
            CheckKind::DaphneLibScalar => "daphne-lib-scalar",
            CheckKind::Fails => "fails",
            CheckKind::Status => "status",
        }
    }
}

#[derive(Debug, Serialize)]
struct CaseDetail {
    name: String,
    idx: u32,
    check: &'static str,
    status: String,
    duration_ms: u128,
    failed_checks: Vec<String>,
    allow_failure: bool,
    log_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    suite: String,
    action: String,
    description: Option<String>,
    started_at: DateTime<Local>,
    finished_at: DateTime<Local>,
    total: usize,
    passed: usize,
    failed: usize,
    soft_failed: usize,
    setup_errors: usize,
    log_file: PathBuf,
    error_log: Option<PathBuf>,
    case_logs_root: PathBuf,
    cases: Vec<CaseDetail>,
}

#[derive(Debug)]
struct CaseOutcome {
    status: CaseStatus,
    duration_ms: u128,
    failed_checks: Vec<String>,
    log_path: PathBuf,
}

#[derive(Debug)]
enum CaseStatus {
    Passed,
    Failed,
    SoftFailed,
    SetupError,
}

impl CaseStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::SoftFailed => "soft_failed",
            CaseStatus::SetupError => "setup_error",
        }
    }
}

fn run_suite(
    manifest: &Manifest,
    suite_path: &Path,
    harness: &Harness,
    workspace: &Path,
) -> Result<()> {
    if manifest.cases.is_empty() {
        bail!(
            "suite {} has no cases defined - add entries to {}",
            suite_label(manifest, suite_path),
            suite_path.display()
        );
    }

    let suite_label = suite_label(manifest, suite_path);
    let logs_root = workspace.join("logs").join(sanitize_case_name(&suite_label));
    fs::create_dir_all(&logs_root)?;
    let timestamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let run_dir = logs_root.join(&timestamp);
    fs::create_dir_all(&run_dir)?;
    let run_log_path = run_dir.join("suite.log");
    let case_logs_root = run_dir.join("cases");
    fs::create_dir_all(&case_logs_root)?;
    let mut run_log = File::create(&run_log_path)?;
    let start = Local::now();

    writeln!(
        run_log,
        "[suite] {} - {}",
        suite_label,
        manifest
            .description
            .as_deref()
            .unwrap_or("no description provided")
    )?;
    writeln!(
        run_log,
        "[suite] daphne: {}, daphnelib: {}",
        harness.config().daphne.path.display(),
        harness.config().daphne_lib.path.display()
    )?;
    info!(suite = %suite_label, cases = manifest.cases.len(), "running suite");

    maybe_run_build(manifest, workspace, &mut run_log)?;

    let mut case_details = Vec::new();
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut soft_failed = 0usize;
    let mut setup_errors = 0usize;

    for case in &manifest.cases {
        let case_slug = sanitize_case_name(&format!("{}-{}", case.name, case.idx));
        let case_log_path = case_logs_root.join(format!("{case_slug}.log"));
        writeln!(
            run_log,
            "[case] starting {} #{} ({}) -> {}",
            case.name,
            case.idx,
            case.check.as_str(),
            rel_path(&case_log_path, workspace).display()
        )?;
        if let Some(desc) = &case.description {
            writeln!(run_log, "        {}", desc)?;
        }
        let outcome = run_case(case, &manifest.dir, harness, &case_log_path)?;

        writeln!(
            run_log,
            "[case] {} #{} {} in {} ms",
            case.name,
            case.idx,
            outcome.status.as_str(),
            outcome.duration_ms
        )?;

        match outcome.status {
            CaseStatus::Passed => passed += 1,
            CaseStatus::Failed => failed += 1,
            CaseStatus::SoftFailed => soft_failed += 1,
            CaseStatus::SetupError => setup_errors += 1,
        }

        case_details.push(CaseDetail {
            name: case.name.clone(),
            idx: case.idx,
            check: case.check.as_str(),
            status: outcome.status.as_str().to_string(),
            duration_ms: outcome.duration_ms,
            failed_checks: outcome.failed_checks,
            allow_failure: case.allow_failure,
            log_path: rel_path(&outcome.log_path, workspace),
        });
    }

    let end = Local::now();
    let error_log_path = run_dir.join("error.log");
    let mut error_log = None;
    if failed + setup_errors > 0 {
        let message = format!(
            "{} cases failed, {} could not be set up. See {} for details.",
            failed,
            setup_errors,
            rel_path(&run_log_path, workspace).display()
        );
        fs::write(&error_log_path, message)?;
        error_log = Some(rel_path(&error_log_path, workspace));
    } else if error_log_path.exists() {
        let _ = fs::remove_file(&error_log_path);
    }

    let summary = RunSummary {
        suite: suite_label.clone(),
        action: "run".into(),
        description: manifest.description.clone(),
        started_at: start,
        finished_at: end,
        total: manifest.cases.len(),
        passed,
        failed,
        soft_failed,
        setup_errors,
        log_file: rel_path(&run_log_path, workspace),
        error_log,
        case_logs_root: rel_path(&case_logs_root, workspace),
        cases: case_details,
    };

    let summary_path = logs_root.join("last_run.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

    let verdict = if failed + setup_errors > 0 {
        "FAILED".red().bold()
    } else {
        "OK".green().bold()
    };
    println!(
        "{} {}: {}/{} passed ({} soft failures, {} setup errors). Log: {}",
        verdict,
        suite_label,
        passed,
        summary.total,
        soft_failed,
        setup_errors,
        summary.log_file.display()
    );

    if failed + setup_errors > 0 {
        bail!(
            "{} failed. Consult {}",
            suite_label,
            summary.log_file.display()
        );
    }

    Ok(())
}

fn run_case(
    case: &TestCase,
    dir: &str,
    harness: &Harness,
    log_path: &Path,
) -> Result<CaseOutcome> {
    let files = CaseFiles::new(dir, &case.name, case.idx);
    let args: Vec<&str> = case.args.iter().map(String::as_str).collect();

    let mut log_file = File::create(log_path)?;
    writeln!(log_file, "[case] {} #{}", case.name, case.idx)?;
    writeln!(
        log_file,
        "[case] command: {}",
        harness.daphne_script(&files.script(), &args)
    )?;

    let start = Instant::now();
    let checked = run_check(case, &files, harness, &args);
    let duration = start.elapsed().as_millis();

    let report = match checked {
        Ok(report) => report,
        Err(err) => {
            if let Some(setup) = err
                .downcast_ref::<SetupError>()
                .filter(|setup| setup.is_missing_reference())
            {
                writeln!(log_file, "[case] setup error: {setup}")?;
                eprintln!("{} {setup}", "ERROR".red().bold());
                return Ok(CaseOutcome {
                    status: CaseStatus::SetupError,
                    duration_ms: duration,
                    failed_checks: Vec::new(),
                    log_path: log_path.to_path_buf(),
                });
            }
            return Err(err.context(format!("failed to run case {} #{}", case.name, case.idx)));
        }
    };

    write!(log_file, "{report}")?;
    if !report.passed() {
        eprint!("{}", report.render_colored());
    }
    debug!(case = %case.name, idx = case.idx, passed = report.passed(), "case finished");

    let status = if report.passed() {
        CaseStatus::Passed
    } else if case.allow_failure {
        CaseStatus::SoftFailed
    } else {
        CaseStatus::Failed
    };

    Ok(CaseOutcome {
        status,
        duration_ms: duration,
        failed_checks: report.failures().map(|check| check.name.clone()).collect(),
        log_path: log_path.to_path_buf(),
    })
}

fn run_check(
    case: &TestCase,
    files: &CaseFiles,
    harness: &Harness,
    args: &[&str],
) -> Result<CheckReport> {
    match case.check {
        CheckKind::SomeRef => harness.compare_to_some_ref_simple(files, args),
        CheckKind::Ref => harness.compare_to_ref_simple(files, args),
        CheckKind::SelfRef => harness.compare_to_self_ref_simple(files, args),
        CheckKind::DaphneLib => harness.compare_to_daphne_lib_simple(files, args),
        CheckKind::DaphneLibScalar => harness.compare_to_daphne_lib_scalar_simple(files, args),
        CheckKind::Fails => harness.check_fails_simple(files, args),
        CheckKind::Status => {
            let Some(expected) = case.expected_status else {
                bail!(
                    "case {} #{} uses check = \"status\" without expected_status",
                    case.name,
                    case.idx
                );
            };
            harness.check_status_code_simple(expected, files, args)
        }
    }
}

fn list_suite(manifest: &Manifest) -> Result<()> {
    for case in &manifest.cases {
        let files = CaseFiles::new(&manifest.dir, &case.name, case.idx);
        let reference = match case.check {
            CheckKind::SomeRef => match files.resolve_reference() {
                Ok(reference) => reference.kind().to_string(),
                Err(err) => format!("{}", err.to_string().red()),
            },
            other => other.as_str().to_string(),
        };
        println!("{} -> {}", files.script().display(), reference);
    }
    Ok(())
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse manifest {}", path.display()))
}

fn suite_label(manifest: &Manifest, suite_path: &Path) -> String {
    manifest.name.clone().unwrap_or_else(|| {
        suite_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "suite".to_string())
    })
}

fn maybe_run_build(manifest: &Manifest, workspace: &Path, log: &mut File) -> Result<()> {
    let Some(script) = manifest.build_script.as_deref() else {
        writeln!(log, "[build] no build script configured")?;
        return Ok(());
    };
    let script_path = workspace.join(script);
    if !script_path.exists() {
        writeln!(
            log,
            "[build] skipped build step because {} does not exist",
            script_path.display()
        )?;
        return Ok(());
    }

    writeln!(log, "[build] executing {}", script_path.display())?;
    let output = Invocation::new(&script_path, script)
        .run()
        .with_context(|| format!("failed to run build script {}", script_path.display()))?;
    log.write_all(&output.stdout)?;
    log.write_all(&output.stderr)?;
    if !output.status.success() {
        bail!(
            "build script {} finished with {}",
            script_path.display(),
            output.status
        );
    }
    Ok(())
}

fn rel_path(path: &Path, workspace: &Path) -> PathBuf {
    path.strip_prefix(workspace).unwrap_or(path).to_path_buf()
}

fn sanitize_case_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
