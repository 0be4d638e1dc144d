use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use simlab_options::{Registry, ResolvedConfig};
use simlab_runner::{
    shell_join, CptBatchDescription, CptLayout, Invocation, LocalConfig, LocalScheduler, Outcome,
    Scheduler, SimulatorTask,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_SINGLE_RUN_CONFIG: &str = "NanhuNoL3";
const DEFAULT_EMU_CONFIG: &str = "EmuTasksConfig";
const DEFAULT_GEM5_CONFIG: &str = "NanhuConfig";

const INST_FLAGS: &[&str] = &["DynInst"];
const MEM_FLAGS: &[&str] = &["LSQUnit", "LSQ", "MemDepUnit", "FFLSQ"];
const DQ_FLAGS: &[&str] = &["DQWake", "DQ", "DQPair", "DQV2", "DQGOF"];
const FETCH_FLAGS: &[&str] = &["Branch", "Fetch", "LoopBuffer"];
const EXEC_FLAGS: &[&str] = &["FUW", "ObExec"];
const CHECK_FLAGS: &[&str] = &["ValueCommit"];
const NOSQ_FLAGS: &[&str] = &["NoSQSMB", "NoSQPred"];
const OMEGA_FLAGS: &[&str] = &[
    "FFCPU",
    "DAllocation",
    "FFSquash",
    "DIEWC",
    "FFExec",
    "Commit",
    "FFCommit",
    "FFInit",
    "Rename",
    "IEW",
    "FFDisp",
];
const FAULT_FLAGS: &[&str] = &["RiscvMisc", "Fault", "PageTableWalker", "TLB"];
const CACHE_DEBUG_FLAGS: &[&str] = &["CacheAll", "RiscvMisc"];

/// Ticks traced before and after the debug tick.
const DEBUG_TICKS_BEFORE: u64 = 40_000 * 500;
const DEBUG_TICKS_AFTER: u64 = 10_000 * 500;

#[derive(Parser)]
#[command(name = "simlab", version, about = "Layered simulator configurations and batch runs")]
struct Cli {
    /// YAML files with extra config variants, loaded after the built-in ones.
    #[arg(long = "layers", global = true)]
    layers: Vec<PathBuf>,
    /// Site configuration; defaults to $SIMLAB_LOCAL_CONFIG.
    #[arg(long, global = true)]
    local_config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SimulatorArg {
    #[value(name = "emu")]
    Emu,
    #[value(name = "gem5")]
    Gem5,
}

impl SimulatorArg {
    fn default_config(self) -> &'static str {
        match self {
            SimulatorArg::Emu => DEFAULT_EMU_CONFIG,
            SimulatorArg::Gem5 => DEFAULT_GEM5_CONFIG,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Runs gem5 once on a single workload, streaming its output.
    SingleRun {
        #[arg(short = 'C', long)]
        config: Option<String>,
        #[arg(short = 'n', long)]
        name: Option<String>,
        #[arg(short = 'w', long)]
        workload: Option<String>,
        #[arg(short = 't', long)]
        debug_tick: Option<u64>,
        #[arg(short = 'd', long)]
        debug: bool,
        #[arg(short = 'f', long)]
        debug_file: Option<String>,
        #[arg(long, value_delimiter = ',')]
        debug_flags: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Runs every selected checkpoint of a SPEC suite.
    Batch {
        #[arg(long, value_enum)]
        simulator: SimulatorArg,
        #[arg(short = 'C', long)]
        config: Option<String>,
        #[arg(long, default_value = "06")]
        ver: String,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        machines: Option<usize>,
        #[arg(long)]
        machine_index: Option<usize>,
        #[arg(long = "workload")]
        workloads: Vec<String>,
        /// Take every checkpoint directory instead of the simpoint summary.
        #[arg(long)]
        uniform: bool,
        /// Split tasks into contiguous chunks instead of by hash.
        #[arg(long)]
        chunked: bool,
        #[arg(long)]
        no_numactl: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    ListConfigs {
        #[arg(long)]
        json: bool,
    },
    /// Shows how a variant's options are built, layer by layer.
    Describe {
        name: String,
        #[arg(long)]
        space: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{err:#}"), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let registry = load_registry(&cli.layers)?;
    match cli.command {
        Commands::SingleRun {
            config,
            name,
            workload,
            debug_tick,
            debug,
            debug_file,
            debug_flags,
            dry_run,
            json,
        } => {
            let config = config.as_deref().unwrap_or(DEFAULT_SINGLE_RUN_CONFIG);
            let resolved = registry.resolve(config)?.materialize()?;
            let local = LocalConfig::discover(cli.local_config.as_deref())?;
            let workload = workload.unwrap_or_else(|| {
                tracing::info!("no workload specified, using the default workload");
                local.default_workload.to_string_lossy().into_owned()
            });
            let request = SingleRunRequest {
                task_name: name.unwrap_or_else(|| "single_run".to_string()),
                workload,
                debug_flags: select_debug_flags(debug, debug_tick.is_some(), debug_flags),
                debug_file,
                debug_tick,
            };
            let task = build_single_run(&local, &resolved, &request)?;
            let invocation = task.materialize()?;
            if dry_run && !json {
                println!("{}", shell_join(&invocation.command(None)));
            }
            let outcome = LocalScheduler::new(1)
                .dry_run(dry_run)
                .execute(&invocation, 0)?;
            if let Outcome::Failed { exit_code } = outcome {
                return Err(anyhow!(
                    "simulation of {} failed (exit code {})",
                    invocation.name,
                    exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
                ));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "single-run",
                    "config": resolved.name,
                    "invocation": invocation,
                    "outcome": outcome,
                })));
            }
            println!("Finished simulation");
        }
        Commands::Batch {
            simulator,
            config,
            ver,
            threads,
            machines,
            machine_index,
            workloads,
            uniform,
            chunked,
            no_numactl,
            dry_run,
            json,
        } => {
            let config = config.as_deref().unwrap_or(simulator.default_config());
            let resolved = registry.resolve(config)?.materialize()?;
            let local = LocalConfig::discover(cli.local_config.as_deref())?;
            let host = current_host();

            let date = chrono::Local::now().format("%Y-%m-%d").to_string();
            let task_name = batch_task_name(&ver, &resolved.name, &date);
            let exe = match simulator {
                SimulatorArg::Emu => local.emu.clone(),
                SimulatorArg::Gem5 => local.gem5_exe(),
            };
            let layout = if uniform {
                CptLayout::Uniform
            } else {
                CptLayout::Simpoint {
                    summary: local.simpoint_summary(&ver),
                }
            };
            let mut desc = CptBatchDescription::new(
                local.checkpoint_dir(&ver),
                exe,
                &local.results_root,
                &ver,
                layout,
            );
            desc.set_task_filter(workloads);
            desc.set_conf(&resolved, &task_name)?;

            let n_machines = machines.unwrap_or_else(|| local.n_machines());
            let machine_index =
                resolve_machine_index(machine_index, host.as_deref(), &local, n_machines)?;
            desc.filter_tasks(!chunked, n_machines, machine_index)?;

            for task in desc.tasks_mut() {
                prepare_batch_task(task, simulator, &local)?;
            }
            let threads = threads.unwrap_or_else(|| local.machine_threads(host.as_deref()));
            if !no_numactl {
                desc.set_numactl(&(0..threads).collect::<Vec<_>>());
            }

            let output_dir = local.results_root.join(&task_name);
            let invocations = desc.invocations()?;
            if !json {
                println!("Output dir {}", output_dir.display());
                println!("{}", invocations.len());
                if dry_run {
                    for line in dry_run_commands(&invocations, threads) {
                        println!("{line}");
                    }
                }
            }

            let summary = LocalScheduler::new(threads)
                .dry_run(dry_run)
                .run_batch(&invocations);
            if !summary.all_succeeded() {
                return Err(anyhow!(
                    "{} of {} tasks failed: {}",
                    summary.failed,
                    summary.total(),
                    summary.failed_tasks.join(", ")
                ));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "batch",
                    "config": resolved.name,
                    "output_dir": output_dir.display().to_string(),
                    "tasks": invocations.len(),
                    "machine_index": machine_index,
                    "n_machines": n_machines,
                    "summary": summary,
                })));
            }
        }
        Commands::ListConfigs { json } => {
            if json {
                let variants: Vec<Value> = registry
                    .names()
                    .filter_map(|name| registry.get(name))
                    .map(|layer| {
                        json!({
                            "name": layer.name(),
                            "parent": layer.parent(),
                            "description": layer.description(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list-configs",
                    "variants": variants,
                })));
            }
            for name in registry.names() {
                let Some(layer) = registry.get(name) else {
                    continue;
                };
                match (layer.parent(), layer.description()) {
                    (Some(parent), Some(desc)) => println!("{name} ({parent}): {desc}"),
                    (Some(parent), None) => println!("{name} ({parent})"),
                    (None, Some(desc)) => println!("{name}: {desc}"),
                    (None, None) => println!("{name}"),
                }
            }
        }
        Commands::Describe { name, space, json } => {
            let resolved = registry.resolve(&name)?.materialize()?;
            let rendered = resolved.options.render(space);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config": resolved,
                    "rendered": rendered,
                })));
            }
            print_resolved(&resolved, &rendered);
        }
    }
    Ok(None)
}

fn load_registry(layers: &[PathBuf]) -> Result<Registry> {
    let mut registry = Registry::builtin();
    for path in layers {
        let count = registry.load_file(path)?;
        tracing::info!(path = %path.display(), variants = count, "loaded config layers");
    }
    Ok(registry)
}

struct SingleRunRequest {
    task_name: String,
    workload: String,
    debug_flags: Vec<String>,
    debug_file: Option<String>,
    debug_tick: Option<u64>,
}

fn build_single_run(
    local: &LocalConfig,
    config: &ResolvedConfig,
    request: &SingleRunRequest,
) -> Result<SimulatorTask> {
    let mut task = SimulatorTask::new(
        local.gem5_exe(),
        &local.results_root,
        &request.task_name,
        &request.task_name,
        "0",
    );
    task.sub_workload_level_path_format();
    task.set_trivial_workdir();
    task.set_avoid_repeat(false);

    if !request.debug_flags.is_empty() {
        task.add_direct_options([format!("--debug-flags={}", request.debug_flags.join(","))])?;
    }
    if let Some(file) = &request.debug_file {
        task.add_direct_options([format!("--debug-file={file}")])?;
    }
    if let Some(tick) = request.debug_tick {
        let (start, end) = debug_window(tick);
        task.add_direct_options([format!("--debug-start={start}"), format!("--debug-end={end}")])?;
    }
    task.add_direct_options([path_arg(&local.fs_script())])?;
    task.apply_config(config)?;
    task.add_dict_options([
        ("--gcpt-restorer", path_arg(&local.gcpt_restorer)),
        ("--generic-rv-cpt", request.workload.clone()),
        ("--dramsim3-ini", path_arg(&local.dramsim3_ini)),
    ])?;
    if !request.workload.ends_with(".gz") {
        task.add_direct_options(["--raw-cpt"])?;
    }
    task.format_options(false)?;
    task.set_output_to_file(false);
    Ok(task)
}

/// `HOSTNAME` when exported, else the system hostname.
fn current_host() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| gethostname::gethostname().into_string().ok())
}

/// Shard of the batch this machine runs. A multi-machine batch must know
/// which machine this is, so an unresolved index is an error there.
fn resolve_machine_index(
    explicit: Option<usize>,
    host: Option<&str>,
    local: &LocalConfig,
    n_machines: usize,
) -> Result<usize> {
    if let Some(index) = explicit {
        return Ok(index);
    }
    let listed = host.and_then(|h| {
        local
            .machine_index(h)
            .or_else(|| h.split_once('.').and_then(|(short, _)| local.machine_index(short)))
    });
    match listed {
        Some(index) => Ok(index),
        None if n_machines <= 1 => Ok(0),
        None => Err(anyhow!(
            "cannot tell which of {n_machines} machines this is (host {}); pass --machine-index",
            host.unwrap_or("unknown")
        )),
    }
}

/// Commands as the batch would launch them, numactl binding included.
fn dry_run_commands(invocations: &[Invocation], threads: usize) -> Vec<String> {
    let workers = threads.min(invocations.len()).max(1);
    invocations
        .iter()
        .enumerate()
        .map(|(i, invocation)| {
            shell_join(&invocation.command(LocalScheduler::core_for(invocation, i % workers)))
        })
        .collect()
}

fn prepare_batch_task(
    task: &mut SimulatorTask,
    simulator: SimulatorArg,
    local: &LocalConfig,
) -> Result<()> {
    task.sub_workload_level_path_format();
    task.set_trivial_workdir();
    task.set_avoid_repeat(true);
    let cpt = task
        .cpt_file()
        .map(path_arg)
        .ok_or_else(|| anyhow!("task {} has no checkpoint", task.id()))?;
    match simulator {
        SimulatorArg::Emu => {
            task.add_dict_options([
                ("-W", "20000000".to_string()),
                ("-I", "40000000".to_string()),
                ("-i", cpt),
            ])?;
            task.format_options(true)?;
        }
        SimulatorArg::Gem5 => {
            task.add_direct_options([path_arg(&local.fs_script())])?;
            task.add_dict_options([
                ("--gcpt-restorer", path_arg(&local.gcpt_restorer)),
                ("--generic-rv-cpt", cpt),
                ("--dramsim3-ini", path_arg(&local.dramsim3_ini)),
            ])?;
            task.format_options(false)?;
        }
    }
    Ok(())
}

/// Explicit flags win, then the tick-window groups, then `-d`.
fn select_debug_flags(debug: bool, has_tick: bool, explicit: Vec<String>) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit;
    }
    let groups: Vec<&[&str]> = if has_tick {
        vec![
            FETCH_FLAGS,
            FAULT_FLAGS,
            INST_FLAGS,
            OMEGA_FLAGS,
            CHECK_FLAGS,
            MEM_FLAGS,
            NOSQ_FLAGS,
            DQ_FLAGS,
            EXEC_FLAGS,
            INST_FLAGS,
            FAULT_FLAGS,
        ]
    } else if debug {
        vec![CACHE_DEBUG_FLAGS]
    } else {
        Vec::new()
    };
    groups
        .into_iter()
        .flatten()
        .map(|flag| (*flag).to_string())
        .collect()
}

fn debug_window(tick: u64) -> (u64, u64) {
    (
        tick.saturating_sub(DEBUG_TICKS_BEFORE),
        tick.saturating_add(DEBUG_TICKS_AFTER),
    )
}

fn batch_task_name(ver: &str, config: &str, date: &str) -> String {
    format!("xs_simpoint_batch/SPEC{ver}_{config}_{date}")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_resolved(resolved: &ResolvedConfig, rendered: &str) {
    println!("variant: {}", resolved.name);
    println!("chain: {}", resolved.lineage.join(" -> "));
    match resolved.window_size {
        Some(size) => println!("window_size: {size}"),
        None => println!("window_size: none"),
    }
    println!("overrides:");
    for entry in &resolved.overrides {
        match &entry.value {
            Some(value) => println!(
                "  {:<24} {:<9} {} = {}",
                entry.layer, entry.action, entry.flag, value
            ),
            None => println!("  {:<24} {:<9} {}", entry.layer, entry.action, entry.flag),
        }
    }
    println!("options: {rendered}");
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::SingleRun { json, .. }
        | Commands::Batch { json, .. }
        | Commands::ListConfigs { json }
        | Commands::Describe { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_window_clamps_at_zero() {
        assert_eq!(debug_window(1_000), (0, 1_000 + 5_000_000));
        assert_eq!(
            debug_window(30_000_000),
            (10_000_000, 35_000_000)
        );
    }

    #[test]
    fn debug_flag_precedence() {
        assert!(select_debug_flags(false, false, Vec::new()).is_empty());
        assert_eq!(
            select_debug_flags(true, false, Vec::new()),
            vec!["CacheAll", "RiscvMisc"]
        );
        let tick_flags = select_debug_flags(true, true, Vec::new());
        assert_eq!(&tick_flags[..3], &["Branch", "Fetch", "LoopBuffer"]);
        assert!(tick_flags.contains(&"FFDisp".to_string()));
        assert_eq!(tick_flags.last().map(String::as_str), Some("TLB"));
        assert_eq!(
            select_debug_flags(true, true, vec!["Fetch".to_string()]),
            vec!["Fetch"]
        );
    }

    #[test]
    fn cli_parses_comma_separated_debug_flags() {
        let cli = Cli::try_parse_from([
            "simlab",
            "single-run",
            "-C",
            "NanhuConfig",
            "--debug-flags",
            "Fetch,DQ",
            "-w",
            "/cpt/a.gz",
        ])
        .unwrap();
        match cli.command {
            Commands::SingleRun {
                config,
                debug_flags,
                workload,
                ..
            } => {
                assert_eq!(config.as_deref(), Some("NanhuConfig"));
                assert_eq!(debug_flags, vec!["Fetch", "DQ"]);
                assert_eq!(workload.as_deref(), Some("/cpt/a.gz"));
            }
            _ => panic!("expected single-run"),
        }
    }

    #[test]
    fn single_run_orders_direct_options_and_marks_raw_checkpoints() {
        let local = LocalConfig {
            gem5_root: PathBuf::from("/opt/gem5"),
            results_root: PathBuf::from("/results"),
            ..LocalConfig::default()
        };
        let resolved = Registry::builtin()
            .resolve("NanhuNoL3")
            .unwrap()
            .materialize()
            .unwrap();
        let request = SingleRunRequest {
            task_name: "dbg".to_string(),
            workload: "/work/bbl.bin".to_string(),
            debug_flags: vec!["Fetch".to_string()],
            debug_file: Some("trace.out".to_string()),
            debug_tick: Some(100_000_000),
        };
        let invocation = build_single_run(&local, &resolved, &request)
            .unwrap()
            .materialize()
            .unwrap();
        assert_eq!(
            &invocation.argv[..6],
            &[
                "--debug-flags=Fetch",
                "--debug-file=trace.out",
                "--debug-start=80000000",
                "--debug-end=105000000",
                "/opt/gem5/configs/example/fs.py",
                "--raw-cpt",
            ]
        );
        assert!(invocation
            .argv
            .contains(&"--generic-rv-cpt=/work/bbl.bin".to_string()));
        assert!(invocation.argv.contains(&"--mem-type=DRAMsim3".to_string()));
        assert_eq!(invocation.output_dir, PathBuf::from("/results/dbg/dbg/0"));
        assert!(!invocation.avoid_repeat);
    }

    #[test]
    fn emu_batch_tasks_use_space_separated_options() {
        let local = LocalConfig::default();
        let mut task = SimulatorTask::new("/opt/emu", "/results", "batch", "gcc", "12")
            .with_cpt_file("/cpt/gcc/12/a.gz");
        prepare_batch_task(&mut task, SimulatorArg::Emu, &local).unwrap();
        let invocation = task.materialize().unwrap();
        assert_eq!(
            invocation.argv,
            vec!["-W", "20000000", "-I", "40000000", "-i", "/cpt/gcc/12/a.gz"]
        );
        assert!(invocation.avoid_repeat);
    }

    #[test]
    fn batch_task_name_is_dated() {
        assert_eq!(
            batch_task_name("06", "NanhuConfig", "2024-05-01"),
            "xs_simpoint_batch/SPEC06_NanhuConfig_2024-05-01"
        );
    }

    fn two_machines() -> LocalConfig {
        LocalConfig {
            machines: vec![
                simlab_runner::Machine {
                    name: "node0".to_string(),
                    threads: 8,
                },
                simlab_runner::Machine {
                    name: "node1".to_string(),
                    threads: 8,
                },
            ],
            ..LocalConfig::default()
        }
    }

    #[test]
    fn machine_index_comes_from_flag_or_host() {
        let local = two_machines();
        assert_eq!(resolve_machine_index(Some(0), Some("node1"), &local, 2).unwrap(), 0);
        assert_eq!(resolve_machine_index(None, Some("node1"), &local, 2).unwrap(), 1);
        assert_eq!(
            resolve_machine_index(None, Some("node1.cluster.local"), &local, 2).unwrap(),
            1
        );
        assert_eq!(resolve_machine_index(None, None, &LocalConfig::default(), 1).unwrap(), 0);
    }

    #[test]
    fn unknown_host_in_multi_machine_batch_is_an_error() {
        let local = two_machines();
        let err = resolve_machine_index(None, Some("laptop"), &local, 2).expect_err("unresolved");
        assert!(err.to_string().contains("--machine-index"), "{}", err);
        assert!(resolve_machine_index(None, None, &local, 2).is_err());
    }

    #[test]
    fn dry_run_commands_carry_slot_cores() {
        let invocations: Vec<Invocation> = ["gcc", "mcf", "lbm"]
            .iter()
            .map(|w| {
                let mut task = SimulatorTask::new("/opt/emu", "/results", "batch", *w, "0");
                task.set_numactl(&[0, 1]);
                task.add_dict_options([("-i", "/cpt/a.gz")]).unwrap();
                task.format_options(true).unwrap();
                task.materialize().unwrap()
            })
            .collect();
        assert_eq!(
            dry_run_commands(&invocations, 2),
            vec![
                "numactl -C 0 -- /opt/emu -i /cpt/a.gz",
                "numactl -C 1 -- /opt/emu -i /cpt/a.gz",
                "numactl -C 0 -- /opt/emu -i /cpt/a.gz",
            ]
        );
    }
}
