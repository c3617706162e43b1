//! Process container capability.
//!
//! One container per step. The default implementation tracks the step's
//! process group: every task joins the first task's pgid before exec, so
//! one kill reaches every process the step spawned, including anything the
//! tasks forked themselves.

use std::io;

pub trait Container: Send {
    /// Prepare the container; returns its id once the first process joins.
    fn create(&mut self) -> io::Result<()>;

    fn id(&self) -> Option<u64>;

    fn add(&mut self, pid: u32) -> io::Result<()>;

    /// Deliver a signal to every process in the container.
    fn signal(&self, signum: i32) -> io::Result<()>;

    /// Container id owning `pid`, if it is ours.
    fn find(&self, pid: u32) -> Option<u64>;

    fn pids(&self) -> Vec<u32>;

    fn destroy(&mut self) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct PgidContainer {
    pgid: Option<u64>,
    pids: Vec<u32>,
}

impl PgidContainer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Container for PgidContainer {
    fn create(&mut self) -> io::Result<()> {
        self.pgid = None;
        self.pids.clear();
        Ok(())
    }

    fn id(&self) -> Option<u64> {
        self.pgid
    }

    fn add(&mut self, pid: u32) -> io::Result<()> {
        // The first member defines the group; children joined it pre-exec.
        if self.pgid.is_none() {
            self.pgid = Some(pid as u64);
        }
        self.pids.push(pid);
        Ok(())
    }

    fn signal(&self, signum: i32) -> io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "container empty"));
        };
        let rc = unsafe { libc::kill(-(pgid as libc::pid_t), signum) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn find(&self, pid: u32) -> Option<u64> {
        let pgid = self.pgid?;
        if self.pids.contains(&pid) {
            return Some(pgid);
        }
        let actual = unsafe { libc::getpgid(pid as libc::pid_t) };
        if actual > 0 && actual as u64 == pgid {
            Some(pgid)
        } else {
            None
        }
    }

    fn pids(&self) -> Vec<u32> {
        self.pids.clone()
    }

    fn destroy(&mut self) -> io::Result<()> {
        if self.pgid.is_some() {
            // Best effort; the group may already be gone.
            let _ = self.signal(libc::SIGKILL);
        }
        self.pgid = None;
        self.pids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pid_defines_the_group() {
        let mut c = PgidContainer::new();
        c.create().unwrap();
        assert_eq!(c.id(), None);
        c.add(4242).unwrap();
        c.add(4243).unwrap();
        assert_eq!(c.id(), Some(4242));
        assert_eq!(c.pids(), vec![4242, 4243]);
        assert_eq!(c.find(4243), Some(4242));
    }

    #[test]
    fn signalling_an_empty_container_errors() {
        let c = PgidContainer::new();
        assert!(c.signal(0).is_err());
    }

    #[test]
    fn destroy_resets() {
        let mut c = PgidContainer::new();
        c.create().unwrap();
        c.add(999_999).unwrap();
        c.destroy().unwrap();
        assert_eq!(c.id(), None);
        assert!(c.pids().is_empty());
    }
}
