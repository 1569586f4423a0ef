/// User namespace handshake
///
/// The child cannot write its own id maps, so creation is a two step exchange
/// over the control channel:
///
/// 1. child unshares `CLONE_NEWUSER` and reports the outcome as an int flag
/// 2. parent writes `/proc/<pid>/uid_map` and `gid_map`, reports success
/// 3. child switches to the configured uid/gid inside the namespace
use crate::ipc::ControlChannel;
use crate::types::{LxceError, Result, UserNsConfig};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Pid, Uid};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `0 <offset> <count>` mapping written to both map files
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdMap {
    pub offset: u32,
    pub count: u32,
}

impl IdMap {
    pub fn new(offset: u32, count: u32) -> Self {
        Self { offset, count }
    }

    /// Line in the format the kernel expects
    pub fn line(&self) -> String {
        format!("0 {} {}\n", self.offset, self.count)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 || fields[0] != "0" {
            return Err(LxceError::NamespaceSetup(format!(
                "Malformed id map line: {:?}",
                line
            )));
        }
        let parse = |s: &str| {
            s.parse::<u32>().map_err(|e| {
                LxceError::NamespaceSetup(format!("Malformed id map value {}: {}", s, e))
            })
        };
        Ok(Self {
            offset: parse(fields[1])?,
            count: parse(fields[2])?,
        })
    }
}

impl From<UserNsConfig> for IdMap {
    fn from(config: UserNsConfig) -> Self {
        Self::new(config.offset, config.count)
    }
}

/// Progress of the handshake on either side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStage {
    Unshared,
    MapsWritten,
    Dropped,
}

/// Paths of the map files of `pid` below `proc_root`
pub fn map_files(proc_root: &Path, pid: Pid) -> (PathBuf, PathBuf) {
    let base = proc_root.join(pid.as_raw().to_string());
    (base.join("uid_map"), base.join("gid_map"))
}

fn write_map_file(path: &Path, map: &IdMap) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        LxceError::NamespaceSetup(format!("Failed to open {}: {}", path.display(), e))
    })?;
    file.write_all(map.line().as_bytes()).map_err(|e| {
        LxceError::NamespaceSetup(format!("Failed to write {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Write uid and gid maps of `pid` below `proc_root`
pub fn write_id_maps_at(proc_root: &Path, pid: Pid, map: &IdMap) -> Result<()> {
    let (uid_map, gid_map) = map_files(proc_root, pid);
    write_map_file(&uid_map, map)?;
    write_map_file(&gid_map, map)?;
    log::debug!("Wrote id map {:?} for pid {}", map, pid);
    Ok(())
}

/// Parent half: wait for the child to unshare, write its maps, report back
pub fn parent_handshake(channel: &ControlChannel, pid: Pid, map: &IdMap) -> Result<HandshakeStage> {
    if !channel.recv_flag()? {
        return Err(LxceError::NamespaceSetup(format!(
            "Child {} failed to create user namespace",
            pid
        )));
    }

    let written = write_id_maps_at(Path::new("/proc"), pid, map);
    channel.send_flag(written.is_ok())?;
    written?;

    Ok(HandshakeStage::MapsWritten)
}

/// Child half: unshare, wait for the maps, then switch ids
///
/// Runs in a freshly cloned child and does not log.
pub fn child_handshake(channel: &ControlChannel, uid: u32, gid: u32) -> Result<HandshakeStage> {
    let unshared = unshare(CloneFlags::CLONE_NEWUSER);
    channel.send_flag(unshared.is_ok())?;
    unshared.map_err(|e| {
        LxceError::NamespaceSetup(format!("Failed to unshare user namespace: {}", e))
    })?;

    await_maps(channel)?;
    switch_ids(uid, gid)
}

/// Wait for the parent's verdict on the map files
fn await_maps(channel: &ControlChannel) -> Result<HandshakeStage> {
    if !channel.recv_flag()? {
        return Err(LxceError::NamespaceSetup(
            "Parent failed to write id maps".to_string(),
        ));
    }
    Ok(HandshakeStage::MapsWritten)
}

fn switch_ids(uid: u32, gid: u32) -> Result<HandshakeStage> {
    let gid = Gid::from_raw(gid);
    let uid = Uid::from_raw(uid);
    setgroups(&[gid])
        .map_err(|e| LxceError::NamespaceSetup(format!("setgroups failed: {}", e)))?;
    setresgid(gid, gid, gid)
        .map_err(|e| LxceError::NamespaceSetup(format!("setresgid failed: {}", e)))?;
    setresuid(uid, uid, uid)
        .map_err(|e| LxceError::NamespaceSetup(format!("setresuid failed: {}", e)))?;

    Ok(HandshakeStage::Dropped)
}
