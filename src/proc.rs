use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};

/// `ESRCH`, returned for files of a process that exited while being read.
const ESRCH: i32 = 3;

bitflags::bitflags! {
    /// Per-process kernel flags (`PF_*`), the ninth field of `/proc/<pid>/stat`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        const IDLE = 0x0000_0002;
        const EXITING = 0x0000_0004;
        const VCPU = 0x0000_0010;
        const WQ_WORKER = 0x0000_0020;
        const FORKNOEXEC = 0x0000_0040;
        const MCE_PROCESS = 0x0000_0080;
        const SUPERPRIV = 0x0000_0100;
        const DUMPCORE = 0x0000_0200;
        const SIGNALED = 0x0000_0400;
        const MEMALLOC = 0x0000_0800;
        const NPROC_EXCEEDED = 0x0000_1000;
        const USED_MATH = 0x0000_2000;
        const NOFREEZE = 0x0000_8000;
        const KSWAPD = 0x0002_0000;
        const MEMALLOC_NOFS = 0x0004_0000;
        const MEMALLOC_NOIO = 0x0008_0000;
        const LOCAL_THROTTLE = 0x0010_0000;
        const KTHREAD = 0x0020_0000;
        const RANDOMIZE = 0x0040_0000;
        const NO_SETAFFINITY = 0x0400_0000;
        const MCE_EARLY = 0x0800_0000;
        const MEMALLOC_PIN = 0x1000_0000;
        const SUSPEND_TASK = 0x8000_0000;
    }
}

impl ProcessFlags {
    pub fn is_kernel_thread(self) -> bool {
        self.contains(Self::KTHREAD)
    }
}

/// One process as seen through `/proc/<pid>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    /// Executable name, at most 15 bytes
    pub comm: String,
    /// Arguments joined by spaces; empty for kernel threads and zombies
    pub cmdline: String,
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    pub session: i32,
    pub tty_nr: i32,
    pub tpgid: i32,
    pub flags: u32,
    pub minflt: u64,
    pub cminflt: u64,
    pub majflt: u64,
    pub cmajflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
}

impl ProcessRecord {
    /// Read `cmdline`, `comm` and `stat` of one process under `root`
    pub fn read(root: &Path, pid: i32) -> Result<Self> {
        let dir = root.join(pid.to_string());
        let cmdline = parse_cmdline(&fs::read(dir.join("cmdline"))?);
        let comm = text(&fs::read(dir.join("comm"))?)
            .trim_end_matches('\n')
            .to_string();

        let stat_path = dir.join("stat");
        let stat = text(&fs::read(&stat_path)?);
        Stat::parse(&stat)
            .and_then(|stat| stat.build(pid, comm, cmdline))
            .map_err(|reason| Error::ProcFormat {
                path: stat_path.display().to_string(),
                reason,
            })
    }

    pub fn flags(&self) -> ProcessFlags {
        ProcessFlags::from_bits_retain(self.flags)
    }

    /// Processes without a command line are kernel threads (or zombies)
    pub fn is_kernel_thread(&self) -> bool {
        self.cmdline.is_empty()
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_kernel_thread() {
            write!(f, "{} [{}]", self.pid, self.comm)
        } else {
            write!(f, "{} {}", self.pid, self.cmdline)
        }
    }
}

/// Read every process under `root`, ordered by pid
///
/// Processes that exit between listing and reading are skipped.
pub fn read_process_table(root: &Path) -> Result<Vec<ProcessRecord>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .filter(|name| name.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|name| name.parse::<i32>().ok())
        {
            pids.push(pid);
        }
    }
    pids.sort_unstable();

    let mut records = Vec::with_capacity(pids.len());
    for pid in pids {
        match ProcessRecord::read(root, pid) {
            Ok(record) => records.push(record),
            Err(Error::IoError(e)) if vanished(&e) => {
                debug!(pid, error = %e, "process exited while reading");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

fn vanished(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(ESRCH)
}

fn text(bytes: &[u8]) -> String {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn parse_cmdline(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\0").unwrap_or(raw);
    let joined: Vec<u8> = raw
        .iter()
        .map(|&b| if b == 0 { b' ' } else { b })
        .collect();
    text(&joined)
}

/// The fields of `/proc/<pid>/stat` up to `num_threads`
struct Stat<'a> {
    pid: i32,
    fields: Vec<&'a str>,
}

impl<'a> Stat<'a> {
    fn parse(line: &'a str) -> std::result::Result<Self, String> {
        let open = line.find('(').ok_or("missing `(`")?;
        let close = line.rfind(')').ok_or("missing `)`")?;
        if close < open {
            return Err("unbalanced parentheses".to_string());
        }
        let pid = line[..open]
            .trim()
            .parse()
            .map_err(|_| format!("bad pid `{}`", line[..open].trim()))?;
        let fields: Vec<&str> = line[close + 1..].split_ascii_whitespace().collect();
        if fields.len() < 18 {
            return Err(format!("expected at least 20 fields, found {}", fields.len() + 2));
        }
        Ok(Self { pid, fields })
    }

    fn field<T: FromStr>(&self, index: usize, name: &str) -> std::result::Result<T, String> {
        self.fields[index]
            .parse()
            .map_err(|_| format!("bad {name} `{}`", self.fields[index]))
    }

    fn build(self, pid: i32, comm: String, cmdline: String) -> std::result::Result<ProcessRecord, String> {
        if self.pid != pid {
            return Err(format!("belongs to pid {}", self.pid));
        }
        let state = self.fields[0].chars().next().ok_or("empty state")?;
        Ok(ProcessRecord {
            pid,
            comm,
            cmdline,
            state,
            ppid: self.field(1, "ppid")?,
            pgrp: self.field(2, "pgrp")?,
            session: self.field(3, "session")?,
            tty_nr: self.field(4, "tty_nr")?,
            tpgid: self.field(5, "tpgid")?,
            flags: self.field(6, "flags")?,
            minflt: self.field(7, "minflt")?,
            cminflt: self.field(8, "cminflt")?,
            majflt: self.field(9, "majflt")?,
            cmajflt: self.field(10, "cmajflt")?,
            utime: self.field(11, "utime")?,
            stime: self.field(12, "stime")?,
            cutime: self.field(13, "cutime")?,
            cstime: self.field(14, "cstime")?,
            priority: self.field(15, "priority")?,
            nice: self.field(16, "nice")?,
            num_threads: self.field(17, "num_threads")?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    pub(crate) fn fake_process(root: &Path, pid: i32, comm: &str, cmdline: &[u8], flags: u32) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{pid} ({comm}) S 1 {pid} {pid} 34816 {pid} {flags} 120 3 4 0 15 7 0 0 20 0 1 0 \
                 4242 10000 200 18446744073709551615\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn reads_user_process() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 42, "bash", b"/bin/bash\0-l\0", 0x0040_0100);

        let record = ProcessRecord::read(root.path(), 42).unwrap();
        assert_eq!(record.cmdline, "/bin/bash -l");
        assert_eq!(record.comm, "bash");
        assert_eq!(record.state, 'S');
        assert_eq!(record.ppid, 1);
        assert_eq!(record.pgrp, 42);
        assert_eq!(record.tty_nr, 34816);
        assert_eq!(record.minflt, 120);
        assert_eq!(record.utime, 15);
        assert_eq!(record.stime, 7);
        assert_eq!(record.priority, 20);
        assert_eq!(record.nice, 0);
        assert_eq!(record.num_threads, 1);
        assert_eq!(
            record.flags(),
            ProcessFlags::RANDOMIZE | ProcessFlags::SUPERPRIV
        );
        assert!(!record.is_kernel_thread());
        assert_eq!(record.to_string(), "42 /bin/bash -l");
    }

    #[test]
    fn kernel_thread_displays_comm() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 1234, "init", b"", 0x0020_8040);

        let record = ProcessRecord::read(root.path(), 1234).unwrap();
        assert!(record.is_kernel_thread());
        assert!(record.flags().is_kernel_thread());
        assert_eq!(record.to_string(), "1234 [init]");
    }

    #[test]
    fn comm_with_spaces_and_parentheses() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 7, "tmux: (server) x", b"tmux\0", 0);

        let record = ProcessRecord::read(root.path(), 7).unwrap();
        assert_eq!(record.comm, "tmux: (server) x");
        assert_eq!(record.state, 'S');
        assert_eq!(record.ppid, 1);
        assert_eq!(record.num_threads, 1);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 9, "odd", b"caf\xe9\0--x\0", 0);
        let record = ProcessRecord::read(root.path(), 9).unwrap();
        assert_eq!(record.cmdline, "caf\u{fffd} --x");
    }

    #[test]
    fn truncated_stat_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 5, "short", b"short\0", 0);
        fs::write(root.path().join("5/stat"), "5 (short) S 1 5\n").unwrap();

        match ProcessRecord::read(root.path(), 5) {
            Err(Error::ProcFormat { path, reason }) => {
                assert!(PathBuf::from(path).ends_with("5/stat"));
                assert!(reason.contains("fields"), "{reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn table_skips_non_numeric_and_vanished_entries() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 300, "c", b"c\0", 0);
        fake_process(root.path(), 2, "b", b"b\0", 0);
        fake_process(root.path(), 10, "gone", b"gone\0", 0);
        fs::remove_file(root.path().join("10/stat")).unwrap();
        fs::create_dir(root.path().join("self")).unwrap();
        fs::write(root.path().join("uptime"), "1.0 2.0\n").unwrap();

        let records = read_process_table(root.path()).unwrap();
        let pids: Vec<i32> = records.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![2, 300]);
    }
}
