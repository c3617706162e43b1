//! `qrun` command line surface.

use std::path::PathBuf;

use clap::Parser;

use quarry_core::layout::TaskDistribution;

fn parse_distribution(input: &str) -> Result<TaskDistribution, String> {
    match input {
        "block" => Ok(TaskDistribution::Block),
        "cyclic" => Ok(TaskDistribution::Cyclic),
        other => {
            if let Some(size) = other.strip_prefix("plane=") {
                let size: u16 = size
                    .parse()
                    .map_err(|_| format!("bad plane size in {input:?}"))?;
                if size == 0 {
                    return Err("plane size must be nonzero".to_string());
                }
                return Ok(TaskDistribution::Plane(size));
            }
            Err(format!(
                "unknown distribution {other:?} (block, cyclic, plane=<n>)"
            ))
        }
    }
}

/// `<signal>@<seconds>`: deliver the signal that many seconds before the
/// step's time limit runs out.
fn parse_signal_spec(input: &str) -> Result<(u16, u32), String> {
    let (sig, secs) = input
        .split_once('@')
        .ok_or_else(|| format!("expected <sig>@<seconds>, got {input:?}"))?;
    let sig: u16 = sig.parse().map_err(|_| format!("bad signal in {input:?}"))?;
    let secs: u32 = secs.parse().map_err(|_| format!("bad seconds in {input:?}"))?;
    Ok((sig, secs))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "qrun", version, about = "run a parallel job step")]
pub struct Cli {
    /// Number of tasks to launch.
    #[arg(short = 'n', long = "ntasks", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub ntasks: u32,

    /// Number of nodes to spread the tasks over.
    #[arg(short = 'N', long = "nodes")]
    pub nodes: Option<u32>,

    /// CPUs required per task.
    #[arg(short = 'c', long = "cpus-per-task", default_value_t = 1)]
    pub cpus_per_task: u32,

    /// Task distribution: block, cyclic, or plane=<n>.
    #[arg(long, default_value = "block", value_parser = parse_distribution)]
    pub distribution: TaskDistribution,

    /// Prefix each output line with its global task id.
    #[arg(short = 'l', long = "label")]
    pub label: bool,

    /// Forward output byte-by-byte instead of line-buffered.
    #[arg(short = 'u', long = "unbuffered")]
    pub unbuffered: bool,

    /// Hand each task's connection to user code instead of framed stdio.
    #[arg(long = "user-managed-io")]
    pub user_managed_io: bool,

    /// Offset of the step's first node within the allocation.
    #[arg(short = 'r', long = "relative")]
    pub relative: Option<u32>,

    /// Required nodes (host pattern).
    #[arg(short = 'w', long = "nodelist")]
    pub nodelist: Option<String>,

    /// Excluded nodes (host pattern).
    #[arg(short = 'x', long = "exclude")]
    pub exclude: Option<String>,

    /// Deliver <sig>@<seconds> before the time limit expires.
    #[arg(long = "signal", value_parser = parse_signal_spec)]
    pub signal: Option<(u16, u32)>,

    /// Time limit in minutes.
    #[arg(short = 't', long = "time")]
    pub time: Option<u32>,

    /// Run a different executable per task range (not yet wired to a file
    /// format; reserved).
    #[arg(long = "multi-prog")]
    pub multi_prog: bool,

    /// Allocate a pseudo-terminal (unsupported).
    #[arg(long)]
    pub pty: bool,

    /// Partition to allocate from.
    #[arg(short = 'p', long)]
    pub partition: Option<String>,

    /// Redirect task stdout to this file pattern (%j, %s, %t expand).
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Redirect task stderr to this file pattern.
    #[arg(short = 'e', long)]
    pub error: Option<String>,

    /// Feed task stdin from this file pattern, or a task id selector.
    #[arg(short = 'i', long)]
    pub input: Option<String>,

    #[arg(short = 'J', long = "job-name")]
    pub job_name: Option<String>,

    /// Fail rather than queue when resources are not free now.
    #[arg(short = 'I', long)]
    pub immediate: bool,

    /// Never share the allocated nodes.
    #[arg(long)]
    pub exclusive: bool,

    /// Only this global task id reads stdin (default 0; "all"/"none" accepted).
    #[arg(long = "stdin-target", default_value = "0")]
    pub stdin_target: String,

    /// Cluster configuration file (falls back to $QUARRY_CONF).
    #[arg(long, env = "QUARRY_CONF")]
    pub config: Option<PathBuf>,

    /// Command to execute and its arguments.
    #[arg(required = true, trailing_var_arg = true)]
    pub argv: Vec<String>,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.pty {
            return Err("--pty is not supported".to_string());
        }
        if self.multi_prog {
            return Err("--multi-prog is not supported".to_string());
        }
        if let Some(nodes) = self.nodes {
            if nodes == 0 {
                return Err("--nodes must be at least 1".to_string());
            }
            if nodes > self.ntasks {
                return Err("more nodes than tasks requested".to_string());
            }
        }
        match self.stdin_target.as_str() {
            "all" | "none" => {}
            other => {
                other
                    .parse::<u32>()
                    .map_err(|_| format!("bad --stdin-target {other:?}"))?;
            }
        }
        Ok(())
    }

    pub fn stdin_mode(&self) -> quarry_proto::message::StdinMode {
        use quarry_proto::message::StdinMode;
        match self.stdin_target.as_str() {
            "all" => StdinMode::AllTasks,
            "none" => StdinMode::NoTask,
            other => StdinMode::OneTask(other.parse().unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("qrun").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let cli = parse(&["hostname"]).unwrap();
        assert_eq!(cli.ntasks, 1);
        assert_eq!(cli.distribution, TaskDistribution::Block);
        assert_eq!(cli.argv, vec!["hostname"]);
        cli.validate().unwrap();
    }

    #[test]
    fn zero_tasks_rejected_by_parser() {
        assert!(parse(&["-n", "0", "hostname"]).is_err());
    }

    #[test]
    fn distribution_forms() {
        assert_eq!(
            parse(&["--distribution", "cyclic", "x"]).unwrap().distribution,
            TaskDistribution::Cyclic
        );
        assert_eq!(
            parse(&["--distribution", "plane=4", "x"]).unwrap().distribution,
            TaskDistribution::Plane(4)
        );
        assert!(parse(&["--distribution", "plane=0", "x"]).is_err());
        assert!(parse(&["--distribution", "spiral", "x"]).is_err());
    }

    #[test]
    fn signal_spec() {
        let cli = parse(&["--signal", "10@60", "x"]).unwrap();
        assert_eq!(cli.signal, Some((10, 60)));
        assert!(parse(&["--signal", "sixty", "x"]).is_err());
    }

    #[test]
    fn pty_declared_but_rejected() {
        let cli = parse(&["--pty", "x"]).unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn more_nodes_than_tasks_rejected() {
        let cli = parse(&["-n", "2", "-N", "4", "x"]).unwrap();
        assert!(cli.validate().is_err());
    }

    #[test]
    fn trailing_command_with_flags() {
        let cli = parse(&["-n", "4", "--", "echo", "-n", "hi"]).unwrap();
        assert_eq!(cli.argv, vec!["echo", "-n", "hi"]);
    }

    #[test]
    fn stdin_target_forms() {
        use quarry_proto::message::StdinMode;
        assert_eq!(parse(&["x"]).unwrap().stdin_mode(), StdinMode::OneTask(0));
        assert_eq!(
            parse(&["--stdin-target", "all", "x"]).unwrap().stdin_mode(),
            StdinMode::AllTasks
        );
        assert_eq!(
            parse(&["--stdin-target", "none", "x"]).unwrap().stdin_mode(),
            StdinMode::NoTask
        );
        let cli = parse(&["--stdin-target", "seven", "x"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
