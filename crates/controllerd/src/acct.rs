//! Accounting sink.
//!
//! The controller emits a record at job start, step start, step completion,
//! and job completion. The sink is a capability: the default file sink
//! appends JSON lines, the null sink discards, and an SQL-backed sink can
//! slot in behind the same trait.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use quarry_proto::message::AcctSnapshot;
use quarry_proto::ErrorCode;

use crate::registry::job::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcctEvent {
    JobStart,
    StepStart,
    StepComplete,
    JobComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcctRecord {
    pub event: AcctEvent,
    pub time: i64,
    pub job_id: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub step_id: Option<u32>,
    pub uid: u32,
    pub partition: String,
    pub job_state: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nodes: Option<String>,
    pub rc: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    pub user_sec: u64,
    pub sys_sec: u64,
    pub max_rss_kb: u64,
}

impl AcctRecord {
    pub fn for_job(event: AcctEvent, job: &JobRecord, rc: u32, reason: Option<String>) -> Self {
        Self {
            event,
            time: Utc::now().timestamp(),
            job_id: job.job_id,
            step_id: None,
            uid: job.uid,
            partition: job.partition.clone(),
            job_state: job.wire_state(),
            nodes: if job.node_names.is_empty() {
                None
            } else {
                Some(quarry_core::hostlist::compress(&job.node_names))
            },
            rc,
            reason,
            user_sec: 0,
            sys_sec: 0,
            max_rss_kb: 0,
        }
    }

    pub fn with_step(mut self, step_id: u32, acct: &AcctSnapshot) -> Self {
        self.step_id = Some(step_id);
        self.user_sec = acct.user_sec;
        self.sys_sec = acct.sys_sec;
        self.max_rss_kb = acct.max_rss_kb;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcctFilter {
    pub job_id: Option<u32>,
    pub uid: Option<u32>,
    pub since: Option<i64>,
}

impl AcctFilter {
    fn matches(&self, rec: &AcctRecord) -> bool {
        self.job_id.is_none_or(|id| rec.job_id == id)
            && self.uid.is_none_or(|uid| rec.uid == uid)
            && self.since.is_none_or(|t| rec.time >= t)
    }
}

pub trait AcctSink: Send + Sync {
    fn set_location(&self, path: &Path) -> Result<(), ErrorCode>;

    fn log_record(&self, rec: &AcctRecord) -> Result<(), ErrorCode>;

    fn get_jobs(&self, filter: &AcctFilter) -> Result<Vec<AcctRecord>, ErrorCode>;

    /// Drop records matched by the filter after handing them back.
    fn archive(&self, filter: &AcctFilter) -> Result<Vec<AcctRecord>, ErrorCode>;

    fn strerror(&self, err: ErrorCode) -> &'static str {
        ErrorCode::strerror(err.as_u32())
    }
}

/// Discards everything; used when no accounting file is configured.
pub struct NullAcctSink;

impl AcctSink for NullAcctSink {
    fn set_location(&self, _path: &Path) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn log_record(&self, _rec: &AcctRecord) -> Result<(), ErrorCode> {
        Ok(())
    }

    fn get_jobs(&self, _filter: &AcctFilter) -> Result<Vec<AcctRecord>, ErrorCode> {
        Ok(Vec::new())
    }

    fn archive(&self, _filter: &AcctFilter) -> Result<Vec<AcctRecord>, ErrorCode> {
        Ok(Vec::new())
    }
}

/// Appends one JSON object per line.
pub struct FileAcctSink {
    path: Mutex<PathBuf>,
}

impl FileAcctSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Mutex::new(path),
        }
    }

    fn read_all(path: &Path) -> Result<Vec<AcctRecord>, ErrorCode> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(_) => return Err(ErrorCode::ReadTooShort),
        };
        let mut out = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(rec) => out.push(rec),
                Err(_) => continue,
            }
        }
        Ok(out)
    }
}

impl AcctSink for FileAcctSink {
    fn set_location(&self, path: &Path) -> Result<(), ErrorCode> {
        *self.path.lock().unwrap() = path.to_path_buf();
        Ok(())
    }

    fn log_record(&self, rec: &AcctRecord) -> Result<(), ErrorCode> {
        let path = self.path.lock().unwrap().clone();
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let line = serde_json::to_string(rec).map_err(|_| ErrorCode::WriteTooShort)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|_| ErrorCode::WriteTooShort)?;
        writeln!(file, "{line}").map_err(|_| ErrorCode::WriteTooShort)?;
        Ok(())
    }

    fn get_jobs(&self, filter: &AcctFilter) -> Result<Vec<AcctRecord>, ErrorCode> {
        let path = self.path.lock().unwrap().clone();
        Ok(Self::read_all(&path)?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    fn archive(&self, filter: &AcctFilter) -> Result<Vec<AcctRecord>, ErrorCode> {
        let path = self.path.lock().unwrap().clone();
        let all = Self::read_all(&path)?;
        let (archived, kept): (Vec<_>, Vec<_>) = all.into_iter().partition(|r| filter.matches(r));
        let mut out = String::new();
        for rec in &kept {
            out.push_str(&serde_json::to_string(rec).map_err(|_| ErrorCode::WriteTooShort)?);
            out.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out).map_err(|_| ErrorCode::WriteTooShort)?;
        std::fs::rename(&tmp, &path).map_err(|_| ErrorCode::WriteTooShort)?;
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmpfile(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("quarry-acct-tests");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn record(job_id: u32, uid: u32, event: AcctEvent) -> AcctRecord {
        AcctRecord {
            event,
            time: 100,
            job_id,
            step_id: None,
            uid,
            partition: "batch".into(),
            job_state: 1,
            nodes: Some("n[0-1]".into()),
            rc: 0,
            reason: None,
            user_sec: 0,
            sys_sec: 0,
            max_rss_kb: 0,
        }
    }

    #[test]
    fn append_and_filter() {
        let sink = FileAcctSink::new(tmpfile("append.jsonl"));
        sink.log_record(&record(1, 1000, AcctEvent::JobStart)).unwrap();
        sink.log_record(&record(2, 2000, AcctEvent::JobStart)).unwrap();
        sink.log_record(&record(1, 1000, AcctEvent::JobComplete)).unwrap();

        let all = sink.get_jobs(&AcctFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let job1 = sink
            .get_jobs(&AcctFilter {
                job_id: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(job1.len(), 2);
        assert!(matches!(job1[1].event, AcctEvent::JobComplete));
    }

    #[test]
    fn archive_removes_matched() {
        let sink = FileAcctSink::new(tmpfile("archive.jsonl"));
        sink.log_record(&record(1, 1000, AcctEvent::JobComplete)).unwrap();
        sink.log_record(&record(2, 1000, AcctEvent::JobComplete)).unwrap();

        let archived = sink
            .archive(&AcctFilter {
                job_id: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(archived.len(), 1);
        let left = sink.get_jobs(&AcctFilter::default()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].job_id, 2);
    }

    #[test]
    fn null_sink_swallows() {
        let sink = NullAcctSink;
        sink.log_record(&record(1, 1, AcctEvent::JobStart)).unwrap();
        assert!(sink.get_jobs(&AcctFilter::default()).unwrap().is_empty());
        assert_eq!(sink.strerror(ErrorCode::InvalidJobId), "invalid job id");
    }
}
