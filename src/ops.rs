//! Filesystem operations.
//!
//! Every operation validates its arguments against the wire bounds, takes
//! locks in class order, then branches: virtual directories are answered
//! from the in-memory tree, local volumes from the underlying filesystem
//! plus the metadata store, and everything else is forwarded to the
//! volume's master. Mutations refresh the cached attributes; an
//! interrupted or lost mutation marks the affected dentries stale instead
//! of succeeding.

use std::ffi::{CString, OsStr};
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirEntryExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use md5::{Digest, Md5};

use crate::codec::{valid_name, valid_path, DataCoder, MAX_DATA, MAX_NAME, MAX_PATH};
use crate::fh::{InternalDentry, InternalFh};
use crate::journal::{JournalEntry, JournalOp};
use crate::metadata::{make_modetype, IntervalKind, MetadataFlags, MetadataRecord};
use crate::network::Reply;
use crate::proto::{
    CreateRes, DirEntry, DirList, DirOpArgs, DirOpRes, Fattr, FType, ForgetArgs, LinkArgs,
    Md5SumArgs, Md5SumRes, MknodArgs, Opcode, OpenArgs, ReadArgs, ReadDirArgs, RenameArgs, Sattr,
    SattrArgs, SymlinkArgs, WriteArgs, ZfsCap, ZfsError, ZfsFh, ZfsResult,
};
use crate::virtual_dir;
use crate::volume::Volume;
use crate::Runtime;

/// Reserved dentry-table parent key under which volume root dentries live,
/// distinguished by volume name.
fn root_parent_key() -> ZfsFh {
    virtual_dir::virtual_fh(0)
}

fn check_running(rt: &Runtime) -> ZfsResult<()> {
    if rt.is_running() {
        Ok(())
    } else {
        Err(ZfsError::Exiting)
    }
}

fn check_name(name: &[u8]) -> ZfsResult<()> {
    if name.len() > MAX_NAME {
        return Err(ZfsError::NameTooLong);
    }
    if !valid_name(name) {
        return Err(ZfsError::Inval);
    }
    Ok(())
}

fn volume_and_fh(rt: &Runtime, fh: &ZfsFh) -> ZfsResult<(Arc<Volume>, Arc<InternalFh>)> {
    let volume = rt.volume_of(fh).ok_or(ZfsError::Stale)?;
    let obj = rt.tables.get_fh(fh).ok_or(ZfsError::Stale)?;
    Ok((volume, obj))
}

/// Absolute local path of the object behind `obj`, built from its first
/// live dentry.
fn local_path_of(volume: &Volume, obj: &Arc<InternalFh>) -> ZfsResult<PathBuf> {
    let root = volume.local_path.as_ref().ok_or(ZfsError::Stale)?;
    let dentry = obj
        .lock_state()
        .live_dentries()
        .into_iter()
        .next()
        .ok_or(ZfsError::Stale)?;
    let mut path = root.clone();
    for component in dentry.path_components() {
        path.push(OsStr::from_bytes(&component));
    }
    Ok(path)
}

fn join_name(dir: &std::path::Path, name: &[u8]) -> PathBuf {
    dir.join(OsStr::from_bytes(name))
}

fn first_dentry(obj: &Arc<InternalFh>) -> Option<Arc<InternalDentry>> {
    obj.lock_state().live_dentries().into_iter().next()
}

/// Map an I/O failure; an interruption marks the dentry stale rather than
/// being retried (the mutation may have happened).
fn map_io(err: std::io::Error, dentry: Option<&Arc<InternalDentry>>) -> ZfsError {
    let mapped = ZfsError::from(err);
    if mapped == ZfsError::Intr {
        if let Some(dentry) = dentry {
            dentry.set_stale();
        }
    }
    mapped
}

fn stat_to_fattr(meta: &std::fs::Metadata, version: u64) -> Fattr {
    let clamp_time = |t: i64| t.clamp(0, i64::from(u32::MAX)) as u32;
    Fattr {
        dev: meta.dev() as u32,
        ino: meta.ino() as u32,
        version,
        ftype: FType::from_mode(meta.mode()),
        mode: meta.mode() & 0o7777,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        size: meta.len(),
        blocks: meta.blocks(),
        blksize: meta.blksize() as u32,
        atime: clamp_time(meta.atime()),
        mtime: clamp_time(meta.mtime()),
        ctime: clamp_time(meta.ctime()),
    }
}

/// Fetch (creating on first sight) the metadata record of a local file.
/// Takes and releases the volume mutex.
fn metadata_for(volume: &Volume, meta: &std::fs::Metadata) -> ZfsResult<MetadataRecord> {
    let modetype = make_modetype(FType::from_mode(meta.mode()), meta.mode() & 0o7777);
    let mut state = volume.lock_state();
    let store = state.metadata.as_mut().ok_or(ZfsError::Stale)?;
    store
        .get_metadata(
            meta.dev() as u32,
            meta.ino() as u32,
            modetype,
            meta.uid(),
            meta.gid(),
        )
        .map_err(|err| {
            warn!("metadata read failed: {err}");
            ZfsError::Io
        })
}

/// Bump the local version after a mutation; cached volumes additionally
/// carry the modified flag until reconciliation.
fn bump_version(rt: &Runtime, volume: &Volume, meta: &std::fs::Metadata) -> ZfsResult<MetadataRecord> {
    let modetype = make_modetype(FType::from_mode(meta.mode()), meta.mode() & 0o7777);
    let mut state = volume.lock_state();
    let store = state.metadata.as_mut().ok_or(ZfsError::Stale)?;
    let mut record = store
        .get_metadata(
            meta.dev() as u32,
            meta.ino() as u32,
            modetype,
            meta.uid(),
            meta.gid(),
        )
        .map_err(|_| ZfsError::Io)?;
    record.set_local_version(record.local_version() + 1);
    record.set_modetype(modetype);
    if !volume.is_master(rt.this_node.id) {
        record.set_flags(record.flags() | MetadataFlags::MODIFIED);
    }
    store.set_metadata(&mut record).map_err(|err| {
        warn!("metadata write failed: {err}");
        ZfsError::Io
    })?;
    Ok(record)
}

fn should_journal(rt: &Runtime, volume: &Volume) -> bool {
    volume.is_local() && !volume.is_master(rt.this_node.id)
}

/// Record a pending directory operation in the journal of `dir`.
fn journal_op(
    rt: &Runtime,
    volume: &Volume,
    dir_obj: &Arc<InternalFh>,
    oper: JournalOp,
    file_fh: &ZfsFh,
    name: &[u8],
) {
    if !should_journal(rt, volume) {
        return;
    }
    let entry = JournalEntry {
        dev: file_fh.dev,
        ino: file_fh.ino,
        generation: file_fh.generation,
        oper,
        name: name.to_vec(),
        master_fh: ZfsFh::default(),
        master_version: 0,
    };
    {
        let mut state = volume.lock_state();
        if let Some(store) = state.metadata.as_mut() {
            if let Err(err) = store.append_journal(dir_obj.fh.ino, &entry) {
                warn!("journal append failed: {err}");
            }
        }
    }
    dir_obj.lock_state().journal.insert(entry);
}

fn make_local_fh(rt: &Runtime, volume: &Volume, record: &MetadataRecord) -> ZfsFh {
    ZfsFh {
        sid: rt.this_node.id,
        vid: volume.id,
        dev: record.dev(),
        ino: record.ino(),
        generation: record.generation(),
    }
}

/// Forward an operation to the volume's master and return the reply.
fn forward(
    rt: &Runtime,
    volume: &Volume,
    opcode: Opcode,
    encode: impl FnOnce(&mut DataCoder) -> Result<(), crate::codec::CodecError>,
) -> ZfsResult<Reply> {
    let master = rt.master_of(volume).ok_or(ZfsError::ConnectionLost)?;
    if master.op_disabled(opcode) {
        return Err(ZfsError::NoSys);
    }
    let conn = master.conn().ok_or(ZfsError::ConnectionLost)?;
    rt.note_rpc();
    let result = conn.call(opcode, rt.this_node.id, encode);
    if matches!(result, Err(ZfsError::NoSys)) {
        master.disable_op(opcode);
    }
    result
}

/// Install (or refresh) the local mirror of a remotely resolved entry.
/// Detects a handle change under an existing dentry: the stale handle is
/// forgotten upstream and the dentry rebuilt.
fn mirror_entry(rt: &Runtime, volume: &Volume, dir_fh: &ZfsFh, name: &[u8], res: &DirOpRes) {
    if let Some(existing) = rt.tables.lookup_dentry(dir_fh, name) {
        let old = existing.fh().fh;
        if old == res.file {
            existing.revalidate();
        } else {
            debug!("dentry {:?} changed handle {old} -> {}", existing, res.file);
            forget_upstream(rt, volume, &old);
            rt.tables.drop_dentry(dir_fh, name);
        }
    }
    let obj = rt.tables.get_or_create_fh(res.file, res.attr);
    let parent = rt
        .tables
        .get_fh(dir_fh)
        .and_then(|dir_obj| first_dentry(&dir_obj));
    rt.tables.add_dentry(parent.as_ref(), *dir_fh, name, obj);
    rt.tables.note_lookup(&res.file);
}

/// Send a FORGET for every lookup of `fh` this node still owes upstream,
/// then drop the local balance.
fn forget_upstream(rt: &Runtime, volume: &Volume, fh: &ZfsFh) {
    let pending = rt.tables.nlookup(fh);
    if pending == 0 {
        return;
    }
    if let Some(master) = rt.master_of(volume) {
        if !volume.is_master(rt.this_node.id) {
            if let Some(conn) = master.conn() {
                let args = ForgetArgs {
                    file: *fh,
                    count: pending as u32,
                };
                if let Err(err) = conn.send_oneway(Opcode::Forget, rt.this_node.id, |dc| {
                    args.encode(dc)
                }) {
                    warn!("forget for {fh} failed: {err}");
                }
            }
        }
    }
    rt.tables.forget(fh, pending as u32);
}

fn decode_res(reply: &Reply) -> ZfsResult<DirOpRes> {
    let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
    DirOpRes::decode(&mut r).map_err(|_| ZfsError::InvalidReply)
}

// ---------------------------------------------------------------------
// Roots and lookup
// ---------------------------------------------------------------------

/// The root of the whole namespace: the virtual root directory.
pub fn root(rt: &Runtime) -> ZfsResult<DirOpRes> {
    check_running(rt)?;
    let entry = rt.vtree.get(virtual_dir::ROOT_INO).ok_or(ZfsError::Stale)?;
    let attr = entry.attr();
    let fh = entry.fh();
    rt.tables.get_or_create_fh(fh, attr);
    rt.tables.note_lookup(&fh);
    Ok(DirOpRes { file: fh, attr })
}

/// Resolve the root of volume `vid`.
pub fn volume_root(rt: &Runtime, vid: u32) -> ZfsResult<DirOpRes> {
    check_running(rt)?;
    let volume = rt.volumes.by_id(vid).ok_or(ZfsError::NoEnt)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::VolumeRoot, |dc| dc.encode_u32(vid))?;
        let res = decode_res(&reply)?;
        install_root_dentry(rt, &volume, &res);
        rt.tables.note_lookup(&res.file);
        return Ok(res);
    }

    let root_path = volume.local_path.as_ref().ok_or(ZfsError::Stale)?;
    let meta = std::fs::metadata(root_path).map_err(|e| map_io(e, None))?;
    let record = metadata_for(&volume, &meta)?;
    let fh = make_local_fh(rt, &volume, &record);
    let attr = stat_to_fattr(&meta, record.local_version());
    let res = DirOpRes { file: fh, attr };
    install_root_dentry(rt, &volume, &res);
    rt.tables.note_lookup(&fh);
    Ok(res)
}

fn install_root_dentry(rt: &Runtime, volume: &Volume, res: &DirOpRes) {
    let obj = rt.tables.get_or_create_fh(res.file, res.attr);
    let mut state = volume.lock_state();
    let valid = state
        .root_dentry
        .as_ref()
        .is_some_and(|dentry| dentry.fh().fh == res.file);
    if !valid {
        drop(state);
        let (dentry, _) =
            rt.tables
                .add_dentry(None, root_parent_key(), volume.name.as_bytes(), obj);
        volume.lock_state().root_dentry = Some(dentry);
    }
}

fn lookup_virtual(rt: &Runtime, dir: &ZfsFh, name: &[u8]) -> ZfsResult<DirOpRes> {
    let entry = rt.vtree.lookup(dir.ino, name).ok_or(ZfsError::NoEnt)?;
    if let Some(vid) = entry.volume_id {
        return volume_root(rt, vid);
    }
    let attr = entry.attr();
    let fh = entry.fh();
    rt.tables.get_or_create_fh(fh, attr);
    rt.tables.note_lookup(&fh);
    Ok(DirOpRes { file: fh, attr })
}

/// Resolve one name below `dir`.
pub fn lookup(rt: &Runtime, dir: &ZfsFh, name: &[u8]) -> ZfsResult<DirOpRes> {
    check_running(rt)?;
    if dir.is_virtual() {
        if name != b".." {
            check_name(name)?;
        }
        return lookup_virtual(rt, dir, name);
    }
    check_name(name)?;
    let (volume, dir_obj) = volume_and_fh(rt, dir)?;

    if !volume.is_local() {
        let args = DirOpArgs { dir: *dir, name };
        let reply = forward(rt, &volume, Opcode::Lookup, |dc| args.encode(dc))?;
        let res = decode_res(&reply)?;
        mirror_entry(rt, &volume, dir, name, &res);
        return Ok(res);
    }

    let dir_path = local_path_of(&volume, &dir_obj)?;
    let path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);
    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    let record = metadata_for(&volume, &meta)?;
    let fh = make_local_fh(rt, &volume, &record);
    let attr = stat_to_fattr(&meta, record.local_version());

    let obj = rt.tables.get_or_create_fh(fh, attr);
    rt.tables.add_dentry(dentry.as_ref(), *dir, name, obj);
    rt.tables.note_lookup(&fh);
    Ok(DirOpRes { file: fh, attr })
}

// ---------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------

pub fn getattr(rt: &Runtime, fh: &ZfsFh) -> ZfsResult<Fattr> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Ok(rt.vtree.get(fh.ino).ok_or(ZfsError::Stale)?.attr());
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::GetAttr, |dc| fh.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let attr = Fattr::decode(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        obj.lock_state().attr = attr;
        return Ok(attr);
    }
    let path = local_path_of(&volume, &obj)?;
    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, None))?;
    let record = metadata_for(&volume, &meta)?;
    if record.generation() != fh.generation {
        return Err(ZfsError::Stale);
    }
    let attr = stat_to_fattr(&meta, record.local_version());
    obj.lock_state().attr = attr;
    Ok(attr)
}

pub fn setattr(rt: &Runtime, fh: &ZfsFh, sattr: &Sattr) -> ZfsResult<Fattr> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let args = SattrArgs {
            file: *fh,
            attr: *sattr,
        };
        let reply = forward(rt, &volume, Opcode::SetAttr, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let attr = Fattr::decode(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        obj.lock_state().attr = attr;
        return Ok(attr);
    }

    let path = local_path_of(&volume, &obj)?;
    let dentry = first_dentry(&obj);
    apply_sattr(&path, sattr).map_err(|e| map_io(e, dentry.as_ref()))?;
    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    let record = bump_version(rt, &volume, &meta)?;
    let attr = stat_to_fattr(&meta, record.local_version());
    obj.lock_state().attr = attr;
    Ok(attr)
}

fn apply_sattr(path: &std::path::Path, sattr: &Sattr) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if sattr.mode != u32::MAX {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(sattr.mode & 0o7777))?;
    }
    if sattr.uid != u32::MAX || sattr.gid != u32::MAX {
        // The unchanged sentinel is already chown's "-1, leave alone".
        let cpath = cstring(path)?;
        let rc = unsafe { libc::chown(cpath.as_ptr(), sattr.uid, sattr.gid) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if sattr.size != u64::MAX {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(sattr.size)?;
    }
    if sattr.atime != u32::MAX || sattr.mtime != u32::MAX {
        let meta = std::fs::symlink_metadata(path)?;
        let atime = if sattr.atime == u32::MAX {
            meta.atime()
        } else {
            i64::from(sattr.atime)
        };
        let mtime = if sattr.mtime == u32::MAX {
            meta.mtime()
        } else {
            i64::from(sattr.mtime)
        };
        let times = [
            libc::timespec {
                tv_sec: atime,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: mtime,
                tv_nsec: 0,
            },
        ];
        let cpath = cstring(path)?;
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn cstring(path: &std::path::Path) -> std::io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))
}

// ---------------------------------------------------------------------
// Open files
// ---------------------------------------------------------------------

fn open_local(path: &std::path::Path, flags: u32) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    match (flags as i32) & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags as i32 & libc::O_TRUNC != 0 {
        options.write(true).truncate(true);
    }
    if flags as i32 & libc::O_APPEND != 0 {
        options.append(true);
    }
    options.open(path)
}

pub fn open(rt: &Runtime, fh: &ZfsFh, flags: u32) -> ZfsResult<ZfsCap> {
    check_running(rt)?;
    if fh.is_virtual() {
        // Virtual directories open read-only for readdir.
        let entry = rt.vtree.get(fh.ino).ok_or(ZfsError::Stale)?;
        let obj = rt.tables.get_or_create_fh(*fh, entry.attr());
        return Ok(obj.issue_cap(flags));
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let args = OpenArgs { file: *fh, flags };
        let reply = forward(rt, &volume, Opcode::Open, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let cap = ZfsCap::decode(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        obj.register_cap(&cap);
        return Ok(cap);
    }

    let path = local_path_of(&volume, &obj)?;
    let dentry = first_dentry(&obj);
    let is_dir = obj.lock_state().attr.ftype == FType::Dir;
    if !is_dir {
        let file = open_local(&path, flags).map_err(|e| map_io(e, dentry.as_ref()))?;
        obj.lock_state().cache_fd(file);
    }

    // On a cached volume ask the master for a capability as well, so
    // uncovered reads can be fetched.
    if should_journal(rt, &volume) && !is_dir {
        let args = OpenArgs { file: *fh, flags };
        match forward(rt, &volume, Opcode::Open, |dc| args.encode(dc)) {
            Ok(reply) => {
                if let Ok(mut r) = reply.reader() {
                    if let Ok(master_cap) = ZfsCap::decode(&mut r) {
                        obj.lock_state().master_cap = Some(master_cap);
                    }
                }
            }
            Err(err) => debug!("master open unavailable: {err}"),
        }
    }
    Ok(obj.issue_cap(flags))
}

pub fn close(rt: &Runtime, cap: &ZfsCap) -> ZfsResult<()> {
    check_running(rt)?;
    let obj = rt.tables.resolve_cap(cap).ok_or(ZfsError::BadF)?;
    if cap.fh.is_virtual() {
        obj.close_cap(cap);
        return Ok(());
    }
    let volume = rt.volume_of(&cap.fh).ok_or(ZfsError::Stale)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::Close, |dc| cap.encode(dc));
        obj.close_cap(cap);
        reply?;
        return Ok(());
    }

    // Persist the interval trees before the descriptor goes away.
    {
        let mut vol_state = volume.lock_state();
        if let Some(store) = vol_state.metadata.as_mut() {
            let mut state = obj.lock_state();
            let ino = cap.fh.ino;
            let crate::fh::FhState {
                updated, modified, ..
            } = &mut *state;
            if let Err(err) = store.close_intervals(ino, IntervalKind::Updated, updated) {
                warn!("interval flush failed: {err}");
            }
            if let Err(err) = store.close_intervals(ino, IntervalKind::Modified, modified) {
                warn!("interval flush failed: {err}");
            }
        }
    }

    let master_cap = obj.lock_state().master_cap;
    if let Some(master_cap) = master_cap {
        if let Err(err) = forward(rt, &volume, Opcode::Close, |dc| master_cap.encode(dc)) {
            debug!("master close failed: {err}");
        }
        obj.lock_state().master_cap = None;
    }
    if obj.close_cap(cap) {
        Ok(())
    } else {
        Err(ZfsError::BadF)
    }
}

// ---------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------

/// Serve a read. On a local volume covered ranges come straight from
/// disk; uncovered ranges of a cached volume are fetched from the master
/// and cached before replying.
pub fn read(rt: &Runtime, cap: &ZfsCap, offset: u64, count: u32) -> ZfsResult<Vec<u8>> {
    check_running(rt)?;
    let count = count.min(MAX_DATA as u32);
    let obj = rt.tables.resolve_cap(cap).ok_or(ZfsError::BadF)?;
    let volume = rt.volume_of(&cap.fh).ok_or(ZfsError::Stale)?;

    if !volume.is_local() {
        let args = ReadArgs {
            cap: *cap,
            offset,
            count,
        };
        let reply = forward(rt, &volume, Opcode::Read, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let data = r.read_data().map_err(|_| ZfsError::InvalidReply)?;
        return Ok(data.to_vec());
    }

    let end = offset.checked_add(u64::from(count)).ok_or(ZfsError::FBig)?;
    let needs_fetch = should_journal(rt, &volume) && {
        let state = obj.lock_state();
        !state.updated.covered(offset, end)
    };
    if needs_fetch {
        fetch_from_master(rt, &volume, &obj, offset, end)?;
    }

    let have_fd = obj.lock_state().any_cached_fd().is_some();
    if !have_fd {
        let path = local_path_of(&volume, &obj)?;
        let file = open_local(&path, libc::O_RDONLY as u32).map_err(|e| map_io(e, None))?;
        obj.lock_state().cache_fd(file);
    }
    let state = obj.lock_state();
    let (file, _) = state.any_cached_fd().ok_or(ZfsError::BadF)?;
    let mut buf = vec![0u8; count as usize];
    let got = file.read_at(&mut buf, offset).map_err(|e| map_io(e, None))?;
    buf.truncate(got);
    Ok(buf)
}

/// Pull the uncovered parts of `[offset, end)` from the master and merge
/// them into the local cache.
fn fetch_from_master(
    rt: &Runtime,
    volume: &Arc<Volume>,
    obj: &Arc<InternalFh>,
    offset: u64,
    end: u64,
) -> ZfsResult<()> {
    let (master_cap, holes) = {
        let state = obj.lock_state();
        (state.master_cap, state.updated.complement(offset, end))
    };
    let Some(master_cap) = master_cap else {
        // No way to reach the master; serve what the local file has.
        return Ok(());
    };
    let path = local_path_of(volume, obj)?;
    for (hole_start, hole_end) in holes {
        let mut at = hole_start;
        while at < hole_end {
            let chunk = (hole_end - at).min(MAX_DATA as u64) as u32;
            let args = ReadArgs {
                cap: master_cap,
                offset: at,
                count: chunk,
            };
            let reply = forward(rt, volume, Opcode::Read, |dc| args.encode(dc))?;
            let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
            let data = r.read_data().map_err(|_| ZfsError::InvalidReply)?;
            if data.is_empty() {
                break;
            }
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| map_io(e, None))?;
            file.write_all_at(data, at).map_err(|e| map_io(e, None))?;
            let mut state = obj.lock_state();
            state.updated.insert(at, at + data.len() as u64);
            drop(state);
            at += data.len() as u64;
            if (data.len() as u32) < chunk {
                break;
            }
        }
    }
    Ok(())
}

/// Apply a write. Partial writes return the number of bytes written.
pub fn write(rt: &Runtime, cap: &ZfsCap, offset: u64, data: &[u8]) -> ZfsResult<u32> {
    check_running(rt)?;
    if data.len() > MAX_DATA || offset.checked_add(data.len() as u64).is_none() {
        return Err(ZfsError::FBig);
    }
    let obj = rt.tables.resolve_cap(cap).ok_or(ZfsError::BadF)?;
    let volume = rt.volume_of(&cap.fh).ok_or(ZfsError::Stale)?;

    if !volume.is_local() {
        let args = WriteArgs {
            cap: *cap,
            offset,
            data,
        };
        let reply = forward(rt, &volume, Opcode::Write, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        return r.read_u32().map_err(|_| ZfsError::InvalidReply);
    }

    if volume.size_limit > 0 && offset + data.len() as u64 > volume.size_limit {
        return Err(ZfsError::NoSpc);
    }

    let have_fd = obj.lock_state().any_cached_fd().is_some();
    if !have_fd {
        let path = local_path_of(&volume, &obj)?;
        let file = open_local(&path, libc::O_WRONLY as u32).map_err(|e| map_io(e, None))?;
        obj.lock_state().cache_fd(file);
    }

    let written = {
        let mut state = obj.lock_state();
        let (file, _) = state.any_cached_fd().ok_or(ZfsError::BadF)?;
        let written = file.write_at(data, offset).map_err(|e| map_io(e, None))?;
        let end = offset + written as u64;
        state.updated.insert(offset, end);
        state.modified.insert(offset, end);
        state.attr.size = state.attr.size.max(end);
        written as u32
    };

    // Refresh the version under the volume mutex, off the fh lock.
    let path = local_path_of(&volume, &obj)?;
    if let Ok(meta) = std::fs::symlink_metadata(&path) {
        if let Ok(record) = bump_version(rt, &volume, &meta) {
            obj.lock_state().attr.version = record.local_version();
        }
    }
    Ok(written)
}

// ---------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------

/// Rough wire size of one directory entry, for page budgeting.
fn dir_entry_size(name: &[u8]) -> u32 {
    16 + name.len() as u32 + 1
}

pub fn readdir(rt: &Runtime, cap: &ZfsCap, cookie: i32, count: u32) -> ZfsResult<DirList> {
    check_running(rt)?;
    let obj = rt.tables.resolve_cap(cap).ok_or(ZfsError::BadF)?;

    if cap.fh.is_virtual() {
        let entries = rt.vtree.readdir(cap.fh.ino).ok_or(ZfsError::Stale)?;
        return Ok(page_entries(
            entries
                .into_iter()
                .map(|e| (e.ino, e.name))
                .collect::<Vec<_>>(),
            cookie,
            count,
        ));
    }

    let volume = rt.volume_of(&cap.fh).ok_or(ZfsError::Stale)?;
    if !volume.is_local() {
        let args = ReadDirArgs {
            cap: *cap,
            cookie,
            count,
        };
        let reply = forward(rt, &volume, Opcode::ReadDir, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        return DirList::decode(&mut r).map_err(|_| ZfsError::InvalidReply);
    }

    let path = local_path_of(&volume, &obj)?;
    let is_root = first_dentry(&obj)
        .map(|dentry| dentry.lock_state().parent.is_none())
        .unwrap_or(false);
    let mut names: Vec<(u32, Vec<u8>)> = Vec::new();
    for entry in std::fs::read_dir(&path).map_err(|e| map_io(e, None))? {
        let entry = entry.map_err(|e| map_io(e, None))?;
        let name = entry.file_name().as_bytes().to_vec();
        if is_root && name == b".zfs" {
            continue;
        }
        names.push((entry.ino() as u32, name));
    }
    names.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(page_entries(names, cookie, count))
}

/// Slice an ordered entry list into one readdir page. Cookies are the
/// 1-based positions in the full ordering, stable across retries.
fn page_entries(names: Vec<(u32, Vec<u8>)>, cookie: i32, count: u32) -> DirList {
    let start = cookie.max(0) as usize;
    let mut entries = Vec::new();
    let mut used = 0u32;
    let mut position = start;
    for (ino, name) in names.iter().skip(start) {
        let size = dir_entry_size(name);
        if !entries.is_empty() && used + size > count {
            break;
        }
        position += 1;
        entries.push(DirEntry {
            ino: *ino,
            cookie: position as i32,
            name: name.clone(),
        });
        used += size;
    }
    DirList {
        eof: position >= names.len(),
        entries,
    }
}

/// Create-and-open in one step.
pub fn create(
    rt: &Runtime,
    dir: &ZfsFh,
    name: &[u8],
    flags: u32,
    sattr: &Sattr,
) -> ZfsResult<CreateRes> {
    check_running(rt)?;
    if dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(name)?;
    let (volume, dir_obj) = volume_and_fh(rt, dir)?;

    if !volume.is_local() {
        let args = crate::proto::CreateArgs {
            location: DirOpArgs { dir: *dir, name },
            flags,
            attr: *sattr,
        };
        let reply = forward(rt, &volume, Opcode::Create, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let res = CreateRes::decode(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        mirror_entry(
            rt,
            &volume,
            dir,
            name,
            &DirOpRes {
                file: res.file,
                attr: res.attr,
            },
        );
        if let Some(obj) = rt.tables.get_fh(&res.file) {
            obj.register_cap(&res.cap);
        }
        return Ok(res);
    }

    let dir_path = local_path_of(&volume, &dir_obj)?;
    let path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if flags as i32 & libc::O_EXCL != 0 {
        options.create_new(true);
    }
    if flags as i32 & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    let mode = if sattr.mode == u32::MAX { 0o644 } else { sattr.mode & 0o7777 };
    options.mode(mode);
    let file = options.open(&path).map_err(|e| map_io(e, dentry.as_ref()))?;

    let meta = file.metadata().map_err(|e| map_io(e, dentry.as_ref()))?;
    let record = metadata_for(&volume, &meta)?;
    let fh = make_local_fh(rt, &volume, &record);
    let attr = stat_to_fattr(&meta, record.local_version());

    let obj = rt.tables.get_or_create_fh(fh, attr);
    {
        let mut state = obj.lock_state();
        state.cache_fd(file);
        state.flags |= MetadataFlags::COMPLETE;
        state.updated.insert(0, attr.size);
    }
    rt.tables.add_dentry(dentry.as_ref(), *dir, name, obj.clone());
    rt.tables.note_lookup(&fh);
    journal_op(rt, &volume, &dir_obj, JournalOp::Add, &fh, name);
    let cap = obj.issue_cap(flags);
    Ok(CreateRes { cap, file: fh, attr })
}

pub fn mkdir(rt: &Runtime, dir: &ZfsFh, name: &[u8], sattr: &Sattr) -> ZfsResult<DirOpRes> {
    check_running(rt)?;
    if dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(name)?;
    let (volume, dir_obj) = volume_and_fh(rt, dir)?;

    if !volume.is_local() {
        let args = crate::proto::MkdirArgs {
            location: DirOpArgs { dir: *dir, name },
            attr: *sattr,
        };
        let reply = forward(rt, &volume, Opcode::Mkdir, |dc| args.encode(dc))?;
        let res = decode_res(&reply)?;
        mirror_entry(rt, &volume, dir, name, &res);
        return Ok(res);
    }

    let dir_path = local_path_of(&volume, &dir_obj)?;
    let path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);
    std::fs::create_dir(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    if sattr.mode != u32::MAX {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(sattr.mode & 0o7777));
    }

    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    let record = metadata_for(&volume, &meta)?;
    let fh = make_local_fh(rt, &volume, &record);
    let attr = stat_to_fattr(&meta, record.local_version());
    let obj = rt.tables.get_or_create_fh(fh, attr);
    rt.tables.add_dentry(dentry.as_ref(), *dir, name, obj);
    rt.tables.note_lookup(&fh);
    journal_op(rt, &volume, &dir_obj, JournalOp::Add, &fh, name);
    Ok(DirOpRes { file: fh, attr })
}

fn remove_entry(
    rt: &Runtime,
    dir: &ZfsFh,
    name: &[u8],
    directory: bool,
) -> ZfsResult<()> {
    check_running(rt)?;
    if dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(name)?;
    let (volume, dir_obj) = volume_and_fh(rt, dir)?;

    let opcode = if directory { Opcode::Rmdir } else { Opcode::Unlink };
    if !volume.is_local() {
        let args = DirOpArgs { dir: *dir, name };
        forward(rt, &volume, opcode, |dc| args.encode(dc))?;
        rt.tables.drop_dentry(dir, name);
        return Ok(());
    }

    let dir_path = local_path_of(&volume, &dir_obj)?;
    let path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);
    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    let is_dir = meta.file_type().is_dir();
    if directory && !is_dir {
        return Err(ZfsError::NotDir);
    }
    if !directory && is_dir {
        return Err(ZfsError::IsDir);
    }

    if directory {
        std::fs::remove_dir(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    } else {
        std::fs::remove_file(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    }

    let victim_fh = ZfsFh {
        sid: rt.this_node.id,
        vid: volume.id,
        dev: meta.dev() as u32,
        ino: meta.ino() as u32,
        generation: 0,
    };
    journal_op(rt, &volume, &dir_obj, JournalOp::Del, &victim_fh, name);

    // Last link gone: drop the stored metadata; otherwise unregister one
    // hardlink.
    {
        let mut state = volume.lock_state();
        if let Some(store) = state.metadata.as_mut() {
            let dev = meta.dev() as u32;
            let ino = meta.ino() as u32;
            let result = if directory || meta.nlink() <= 1 {
                store.delete_metadata(dev, ino).map(|_| ())
            } else {
                let parent_meta = std::fs::symlink_metadata(&dir_path);
                if let Ok(parent_meta) = parent_meta {
                    let entry = crate::hardlink::HardlinkEntry {
                        parent_dev: parent_meta.dev() as u32,
                        parent_ino: parent_meta.ino() as u32,
                        name: name.to_vec(),
                    };
                    let mut list = store.read_hardlinks(ino).unwrap_or_default();
                    list.delete(entry.parent_dev, entry.parent_ino, &entry.name);
                    store.write_hardlinks(ino, &list)
                } else {
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!("metadata cleanup failed: {err}");
            }
        }
    }

    rt.tables.drop_dentry(dir, name);
    Ok(())
}

pub fn unlink(rt: &Runtime, dir: &ZfsFh, name: &[u8]) -> ZfsResult<()> {
    remove_entry(rt, dir, name, false)
}

pub fn rmdir(rt: &Runtime, dir: &ZfsFh, name: &[u8]) -> ZfsResult<()> {
    remove_entry(rt, dir, name, true)
}

pub fn rename(
    rt: &Runtime,
    from_dir: &ZfsFh,
    from_name: &[u8],
    to_dir: &ZfsFh,
    to_name: &[u8],
) -> ZfsResult<()> {
    check_running(rt)?;
    if from_dir.is_virtual() || to_dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(from_name)?;
    check_name(to_name)?;
    if from_dir.vid != to_dir.vid {
        return Err(ZfsError::XDev);
    }
    let (volume, from_obj) = volume_and_fh(rt, from_dir)?;
    let (_, to_obj) = volume_and_fh(rt, to_dir)?;

    if !volume.is_local() {
        let args = RenameArgs {
            from: DirOpArgs {
                dir: *from_dir,
                name: from_name,
            },
            to: DirOpArgs {
                dir: *to_dir,
                name: to_name,
            },
        };
        forward(rt, &volume, Opcode::Rename, |dc| args.encode(dc))?;
        if let Some(to_parent) = first_dentry(&to_obj) {
            rt.tables
                .rekey_dentry(from_dir, from_name, &to_parent, *to_dir, to_name);
        } else {
            rt.tables.drop_dentry(from_dir, from_name);
        }
        return Ok(());
    }

    let from_dir_path = local_path_of(&volume, &from_obj)?;
    let from_path = join_name(&from_dir_path, from_name);
    let to_dir_path = local_path_of(&volume, &to_obj)?;
    let to_path = join_name(&to_dir_path, to_name);
    let from_dentry = first_dentry(&from_obj);

    let meta = std::fs::symlink_metadata(&from_path).map_err(|e| map_io(e, from_dentry.as_ref()))?;
    if meta.file_type().is_dir() {
        let moved = ZfsFh {
            sid: rt.this_node.id,
            vid: volume.id,
            dev: meta.dev() as u32,
            ino: meta.ino() as u32,
            generation: 0,
        };
        // A directory must never move below itself.
        let target_is_self = moved.dev == to_dir.dev && moved.ino == to_dir.ino;
        if target_is_self || is_below(rt, &moved, to_dir) {
            return Err(ZfsError::Inval);
        }
    }

    std::fs::rename(&from_path, &to_path).map_err(|e| map_io(e, from_dentry.as_ref()))?;

    let moved_fh = ZfsFh {
        sid: rt.this_node.id,
        vid: volume.id,
        dev: meta.dev() as u32,
        ino: meta.ino() as u32,
        generation: 0,
    };
    journal_op(rt, &volume, &from_obj, JournalOp::Del, &moved_fh, from_name);
    journal_op(rt, &volume, &to_obj, JournalOp::Add, &moved_fh, to_name);

    if let Some(to_parent) = first_dentry(&to_obj) {
        rt.tables
            .rekey_dentry(from_dir, from_name, &to_parent, *to_dir, to_name);
    } else {
        rt.tables.drop_dentry(from_dir, from_name);
    }

    for dir_path in [&from_dir_path, &to_dir_path] {
        if let Ok(dir_meta) = std::fs::symlink_metadata(dir_path) {
            let _ = bump_version(rt, &volume, &dir_meta);
        }
    }
    Ok(())
}

/// Walk the dentry chain upward from `candidate` looking for `moved`
/// (compared by device and inode).
fn is_below(rt: &Runtime, moved: &ZfsFh, candidate: &ZfsFh) -> bool {
    let Some(obj) = rt.tables.get_fh(candidate) else {
        return false;
    };
    let Some(mut dentry) = first_dentry(&obj) else {
        return false;
    };
    loop {
        let parent = {
            let state = dentry.lock_state();
            state.parent.clone().and_then(|weak| weak.upgrade())
        };
        match parent {
            Some(parent) => {
                let fh = parent.fh().fh;
                if fh.dev == moved.dev && fh.ino == moved.ino {
                    return true;
                }
                dentry = parent;
            }
            None => return false,
        }
    }
}

pub fn link(rt: &Runtime, from: &ZfsFh, to_dir: &ZfsFh, name: &[u8]) -> ZfsResult<()> {
    check_running(rt)?;
    if from.is_virtual() || to_dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(name)?;
    if from.vid != to_dir.vid {
        return Err(ZfsError::XDev);
    }
    let (volume, from_obj) = volume_and_fh(rt, from)?;
    let (_, dir_obj) = volume_and_fh(rt, to_dir)?;

    if !volume.is_local() {
        let args = LinkArgs {
            from: *from,
            to: DirOpArgs { dir: *to_dir, name },
        };
        forward(rt, &volume, Opcode::Link, |dc| args.encode(dc))?;
        return Ok(());
    }

    let from_path = local_path_of(&volume, &from_obj)?;
    let dir_path = local_path_of(&volume, &dir_obj)?;
    let to_path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);
    std::fs::hard_link(&from_path, &to_path).map_err(|e| map_io(e, dentry.as_ref()))?;

    let dir_meta = std::fs::symlink_metadata(&dir_path).map_err(|e| map_io(e, None))?;
    let entry = crate::hardlink::HardlinkEntry {
        parent_dev: dir_meta.dev() as u32,
        parent_ino: dir_meta.ino() as u32,
        name: name.to_vec(),
    };
    {
        let mut state = volume.lock_state();
        if let Some(store) = state.metadata.as_mut() {
            if let Err(err) = store.append_hardlink(from.ino, &entry) {
                warn!("hardlink append failed: {err}");
            }
        }
    }
    from_obj.lock_state().hardlinks.insert(entry);

    journal_op(rt, &volume, &dir_obj, JournalOp::Add, from, name);
    rt.tables.add_dentry(dentry.as_ref(), *to_dir, name, from_obj.clone());

    let meta = std::fs::symlink_metadata(&from_path).map_err(|e| map_io(e, None))?;
    let record = bump_version(rt, &volume, &meta)?;
    from_obj.lock_state().attr = stat_to_fattr(&meta, record.local_version());
    Ok(())
}

pub fn symlink(
    rt: &Runtime,
    dir: &ZfsFh,
    name: &[u8],
    target: &[u8],
    _sattr: &Sattr,
) -> ZfsResult<DirOpRes> {
    check_running(rt)?;
    if dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(name)?;
    if target.len() > MAX_PATH || !valid_path(target) {
        return Err(ZfsError::NameTooLong);
    }
    let (volume, dir_obj) = volume_and_fh(rt, dir)?;

    if !volume.is_local() {
        let args = SymlinkArgs {
            from: DirOpArgs { dir: *dir, name },
            to: target,
            attr: *_sattr,
        };
        let reply = forward(rt, &volume, Opcode::Symlink, |dc| args.encode(dc))?;
        let res = decode_res(&reply)?;
        mirror_entry(rt, &volume, dir, name, &res);
        return Ok(res);
    }

    let dir_path = local_path_of(&volume, &dir_obj)?;
    let path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);
    std::os::unix::fs::symlink(OsStr::from_bytes(target), &path)
        .map_err(|e| map_io(e, dentry.as_ref()))?;

    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    let record = metadata_for(&volume, &meta)?;
    let fh = make_local_fh(rt, &volume, &record);
    let attr = stat_to_fattr(&meta, record.local_version());
    let obj = rt.tables.get_or_create_fh(fh, attr);
    rt.tables.add_dentry(dentry.as_ref(), *dir, name, obj);
    rt.tables.note_lookup(&fh);
    journal_op(rt, &volume, &dir_obj, JournalOp::Add, &fh, name);
    Ok(DirOpRes { file: fh, attr })
}

pub fn readlink(rt: &Runtime, fh: &ZfsFh) -> ZfsResult<Vec<u8>> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Err(ZfsError::Inval);
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::ReadLink, |dc| fh.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let path = crate::proto::decode_path(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        return Ok(path.to_vec());
    }
    let path = local_path_of(&volume, &obj)?;
    let target = std::fs::read_link(&path).map_err(|e| map_io(e, None))?;
    let bytes = target.as_os_str().as_bytes().to_vec();
    if bytes.len() > MAX_PATH {
        return Err(ZfsError::NameTooLong);
    }
    Ok(bytes)
}

pub fn mknod(
    rt: &Runtime,
    dir: &ZfsFh,
    name: &[u8],
    sattr: &Sattr,
    ftype: FType,
    rdev: u32,
) -> ZfsResult<DirOpRes> {
    use nix::sys::stat::{Mode, SFlag};

    check_running(rt)?;
    if dir.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    check_name(name)?;
    let (volume, dir_obj) = volume_and_fh(rt, dir)?;

    if !volume.is_local() {
        let args = MknodArgs {
            location: DirOpArgs { dir: *dir, name },
            attr: *sattr,
            ftype,
            rdev,
        };
        let reply = forward(rt, &volume, Opcode::Mknod, |dc| args.encode(dc))?;
        let res = decode_res(&reply)?;
        mirror_entry(rt, &volume, dir, name, &res);
        return Ok(res);
    }

    let kind = match ftype {
        FType::Reg => SFlag::S_IFREG,
        FType::Chr => SFlag::S_IFCHR,
        FType::Blk => SFlag::S_IFBLK,
        FType::Sock => SFlag::S_IFSOCK,
        FType::Fifo => SFlag::S_IFIFO,
        FType::Dir | FType::Lnk | FType::Bad => return Err(ZfsError::Inval),
    };
    let mode = if sattr.mode == u32::MAX { 0o644 } else { sattr.mode & 0o7777 };

    let dir_path = local_path_of(&volume, &dir_obj)?;
    let path = join_name(&dir_path, name);
    let dentry = first_dentry(&dir_obj);
    nix::sys::stat::mknod(
        &path,
        kind,
        Mode::from_bits_truncate(mode),
        libc::dev_t::from(rdev),
    )
    .map_err(|errno| {
        let err = ZfsError::from(errno);
        if err == ZfsError::Intr {
            if let Some(dentry) = &dentry {
                dentry.set_stale();
            }
        }
        err
    })?;

    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, dentry.as_ref()))?;
    let record = metadata_for(&volume, &meta)?;
    let fh = make_local_fh(rt, &volume, &record);
    let attr = stat_to_fattr(&meta, record.local_version());
    let obj = rt.tables.get_or_create_fh(fh, attr);
    rt.tables.add_dentry(dentry.as_ref(), *dir, name, obj);
    rt.tables.note_lookup(&fh);
    journal_op(rt, &volume, &dir_obj, JournalOp::Add, &fh, name);
    Ok(DirOpRes { file: fh, attr })
}

// ---------------------------------------------------------------------
// Checksums, info, forget
// ---------------------------------------------------------------------

pub fn md5sum(rt: &Runtime, args: &Md5SumArgs) -> ZfsResult<Md5SumRes> {
    check_running(rt)?;
    let obj = rt.tables.resolve_cap(&args.cap).ok_or(ZfsError::BadF)?;
    let volume = rt.volume_of(&args.cap.fh).ok_or(ZfsError::Stale)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::Md5Sum, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        return Md5SumRes::decode(&mut r).map_err(|_| ZfsError::InvalidReply);
    }

    let path = local_path_of(&volume, &obj)?;
    let file = File::open(&path).map_err(|e| map_io(e, None))?;
    let size = file.metadata().map_err(|e| map_io(e, None))?.len();

    let mut res = Md5SumRes {
        size,
        ..Md5SumRes::default()
    };
    for (&offset, &length) in args.offsets.iter().zip(&args.lengths) {
        if offset >= size {
            break;
        }
        let want = u64::from(length).min(size - offset) as usize;
        let mut buf = vec![0u8; want];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| map_io(e, None))?;
        let mut hasher = Md5::new();
        hasher.update(&buf);
        res.offsets.push(offset);
        res.lengths.push(want as u32);
        res.digests.push(hasher.finalize().into());
    }
    Ok(res)
}

/// Path of the file behind `fh` relative to its volume root.
pub fn file_info(rt: &Runtime, fh: &ZfsFh) -> ZfsResult<Vec<u8>> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Err(ZfsError::Inval);
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::FileInfo, |dc| fh.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        let path = crate::proto::decode_path(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        return Ok(path.to_vec());
    }
    let dentry = first_dentry(&obj).ok_or(ZfsError::Stale)?;
    let mut path = Vec::new();
    for component in dentry.path_components() {
        path.push(b'/');
        path.extend_from_slice(&component);
    }
    if path.is_empty() {
        path.push(b'/');
    }
    Ok(path)
}

/// Balance `count` lookups of `fh`. Fire-and-forget: no reply exists.
pub fn forget(rt: &Runtime, fh: &ZfsFh, count: u32) {
    rt.tables.forget(fh, count);
    if let Some(volume) = rt.volume_of(fh) {
        if !volume.is_local() && !volume.is_master(rt.this_node.id) {
            if let Some(conn) = rt.master_of(&volume).and_then(|master| master.conn()) {
                let args = ForgetArgs { file: *fh, count };
                if let Err(err) =
                    conn.send_oneway(Opcode::Forget, rt.this_node.id, |dc| args.encode(dc))
                {
                    debug!("forwarding forget failed: {err}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Extended attributes
// ---------------------------------------------------------------------

fn xattr_name_cstring(name: &[u8]) -> ZfsResult<CString> {
    if name.is_empty() || name.len() > MAX_NAME {
        return Err(ZfsError::NameTooLong);
    }
    CString::new(name).map_err(|_| ZfsError::Inval)
}

pub fn setxattr(
    rt: &Runtime,
    fh: &ZfsFh,
    name: &[u8],
    value: &[u8],
    flags: u32,
) -> ZfsResult<()> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let args = crate::proto::SetXattrArgs {
            file: *fh,
            name,
            value,
            flags,
        };
        forward(rt, &volume, Opcode::SetXattr, |dc| args.encode(dc))?;
        return Ok(());
    }
    let path = local_path_of(&volume, &obj)?;
    let cpath = cstring(&path).map_err(|_| ZfsError::Inval)?;
    let cname = xattr_name_cstring(name)?;
    let rc = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags as libc::c_int,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, None))?;
    let _ = bump_version(rt, &volume, &meta);
    Ok(())
}

pub fn getxattr(rt: &Runtime, fh: &ZfsFh, name: &[u8]) -> ZfsResult<Vec<u8>> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Err(ZfsError::NoData);
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let args = crate::proto::XattrNameArgs { file: *fh, name };
        let reply = forward(rt, &volume, Opcode::GetXattr, |dc| args.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        return Ok(r.read_data().map_err(|_| ZfsError::InvalidReply)?.to_vec());
    }
    let path = local_path_of(&volume, &obj)?;
    let cpath = cstring(&path).map_err(|_| ZfsError::Inval)?;
    let cname = xattr_name_cstring(name)?;
    let mut buf = vec![0u8; MAX_DATA];
    let got = unsafe {
        libc::getxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if got < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    buf.truncate(got as usize);
    Ok(buf)
}

pub fn listxattr(rt: &Runtime, fh: &ZfsFh) -> ZfsResult<Vec<u8>> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Ok(Vec::new());
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let reply = forward(rt, &volume, Opcode::ListXattr, |dc| fh.encode(dc))?;
        let mut r = reply.reader().map_err(|_| ZfsError::InvalidReply)?;
        return Ok(r.read_data().map_err(|_| ZfsError::InvalidReply)?.to_vec());
    }
    let path = local_path_of(&volume, &obj)?;
    let cpath = cstring(&path).map_err(|_| ZfsError::Inval)?;
    let mut buf = vec![0u8; MAX_DATA];
    let got = unsafe {
        libc::listxattr(
            cpath.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if got < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    buf.truncate(got as usize);
    Ok(buf)
}

pub fn removexattr(rt: &Runtime, fh: &ZfsFh, name: &[u8]) -> ZfsResult<()> {
    check_running(rt)?;
    if fh.is_virtual() {
        return Err(ZfsError::RoFs);
    }
    let (volume, obj) = volume_and_fh(rt, fh)?;
    if !volume.is_local() {
        let args = crate::proto::XattrNameArgs { file: *fh, name };
        forward(rt, &volume, Opcode::RemoveXattr, |dc| args.encode(dc))?;
        return Ok(());
    }
    let path = local_path_of(&volume, &obj)?;
    let cpath = cstring(&path).map_err(|_| ZfsError::Inval)?;
    let cname = xattr_name_cstring(name)?;
    let rc = unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let meta = std::fs::symlink_metadata(&path).map_err(|e| map_io(e, None))?;
    let _ = bump_version(rt, &volume, &meta);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    /// A runtime with one local volume mastered here, rooted in a tempdir.
    fn local_rt() -> (tempfile::TempDir, Arc<Runtime>) {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            "nodeid 1\nnodename orion\nvolume 5 home /home 1 {}\n",
            dir.path().display()
        );
        let rt = Runtime::new(Config::parse(&text).unwrap()).unwrap();
        (dir, rt)
    }

    fn home_root(rt: &Runtime) -> DirOpRes {
        volume_root(rt, 5).unwrap()
    }

    #[test]
    fn root_and_virtual_lookup() {
        let (_dir, rt) = local_rt();
        let res = root(&rt).unwrap();
        assert!(res.file.is_virtual());
        assert_eq!(res.attr.ftype, FType::Dir);

        let home = lookup(&rt, &res.file, b"home").unwrap();
        assert!(!home.file.is_virtual());
        assert_eq!(home.attr.ftype, FType::Dir);

        let missing = lookup(&rt, &res.file, b"nope");
        assert_eq!(missing.unwrap_err(), ZfsError::NoEnt);
    }

    #[test]
    fn create_write_read_round_trip() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"data.bin",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();

        let payload = b"hello interval world".to_vec();
        let wrote = write(&rt, &created.cap, 3, &payload).unwrap();
        assert_eq!(wrote as usize, payload.len());

        let got = read(&rt, &created.cap, 3, payload.len() as u32).unwrap();
        assert_eq!(got, payload);

        // The write landed in both interval trees.
        let obj = rt.tables.get_fh(&created.file).unwrap();
        {
            let state = obj.lock_state();
            assert!(state.updated.covered(3, 3 + payload.len() as u64));
            assert!(state.modified.covered(3, 3 + payload.len() as u64));
        }
        close(&rt, &created.cap).unwrap();
    }

    #[test]
    fn covered_local_read_issues_no_rpc() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"f",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        write(&rt, &created.cap, 0, b"0123456789").unwrap();
        let before = rt.rpc_count();
        let got = read(&rt, &created.cap, 2, 4).unwrap();
        assert_eq!(got, b"2345");
        assert_eq!(rt.rpc_count(), before);
    }

    #[test]
    fn mkdir_twice_is_eexist() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let first = mkdir(&rt, &dir_fh, b"sub", &Sattr::default()).unwrap();
        assert_eq!(first.attr.ftype, FType::Dir);
        let second = mkdir(&rt, &dir_fh, b"sub", &Sattr::default());
        assert_eq!(second.unwrap_err(), ZfsError::Exist);
        // State equals a single mkdir.
        let looked = lookup(&rt, &dir_fh, b"sub").unwrap();
        assert_eq!(looked.file, first.file);
    }

    #[test]
    fn rename_preserves_file_handle() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"a",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        let before = lookup(&rt, &dir_fh, b"a").unwrap();
        assert_eq!(before.file, created.file);

        rename(&rt, &dir_fh, b"a", &dir_fh, b"b").unwrap();
        let after = lookup(&rt, &dir_fh, b"b").unwrap();
        assert_eq!(after.file, before.file);
        assert_eq!(lookup(&rt, &dir_fh, b"a").unwrap_err(), ZfsError::NoEnt);
    }

    #[test]
    fn rename_into_own_subtree_is_rejected() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let parent = mkdir(&rt, &dir_fh, b"parent", &Sattr::default()).unwrap();
        let child = mkdir(&rt, &parent.file, b"child", &Sattr::default()).unwrap();
        let err = rename(&rt, &dir_fh, b"parent", &child.file, b"oops").unwrap_err();
        assert_eq!(err, ZfsError::Inval);
    }

    #[test]
    fn unlink_and_rmdir() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"f",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        close(&rt, &created.cap).unwrap();
        assert_eq!(rmdir(&rt, &dir_fh, b"f").unwrap_err(), ZfsError::NotDir);
        unlink(&rt, &dir_fh, b"f").unwrap();
        assert_eq!(lookup(&rt, &dir_fh, b"f").unwrap_err(), ZfsError::NoEnt);

        mkdir(&rt, &dir_fh, b"d", &Sattr::default()).unwrap();
        assert_eq!(unlink(&rt, &dir_fh, b"d").unwrap_err(), ZfsError::IsDir);
        rmdir(&rt, &dir_fh, b"d").unwrap();
    }

    #[test]
    fn readdir_pages_are_ordered_and_stable() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        for name in [&b"charlie"[..], b"alpha", b"bravo"] {
            let created = create(
                &rt,
                &dir_fh,
                name,
                libc::O_RDWR as u32,
                &Sattr::default(),
            )
            .unwrap();
            close(&rt, &created.cap).unwrap();
        }
        let cap = open(&rt, &dir_fh, libc::O_RDONLY as u32).unwrap();
        let page = readdir(&rt, &cap, 0, 4096).unwrap();
        let names: Vec<_> = page.entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec()]);
        assert!(page.eof);
        // The metadata directory never shows through.
        assert!(!names.contains(&b".zfs".to_vec()));

        // Restarting from a cookie yields the suffix.
        let rest = readdir(&rt, &cap, page.entries[0].cookie, 4096).unwrap();
        let names: Vec<_> = rest.entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![b"bravo".to_vec(), b"charlie".to_vec()]);
    }

    #[test]
    fn symlink_and_readlink() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let res = symlink(&rt, &dir_fh, b"ln", b"target/file", &Sattr::default()).unwrap();
        assert_eq!(res.attr.ftype, FType::Lnk);
        assert_eq!(readlink(&rt, &res.file).unwrap(), b"target/file".to_vec());
    }

    #[test]
    fn hard_link_shares_handle_and_lists() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"orig",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        close(&rt, &created.cap).unwrap();
        link(&rt, &created.file, &dir_fh, b"alias").unwrap();

        let a = lookup(&rt, &dir_fh, b"orig").unwrap();
        let b = lookup(&rt, &dir_fh, b"alias").unwrap();
        assert_eq!(a.file.ino, b.file.ino);
        assert_eq!(b.attr.nlink, 2);

        let obj = rt.tables.get_fh(&created.file).unwrap();
        assert_eq!(obj.lock_state().hardlinks.len(), 1);
    }

    #[test]
    fn name_bounds() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let long = vec![b'x'; MAX_NAME + 1];
        assert_eq!(
            lookup(&rt, &dir_fh, &long).unwrap_err(),
            ZfsError::NameTooLong
        );
        assert_eq!(lookup(&rt, &dir_fh, b"").unwrap_err(), ZfsError::Inval);
        assert_eq!(lookup(&rt, &dir_fh, b"a/b").unwrap_err(), ZfsError::Inval);
    }

    #[test]
    fn setattr_applies_mode_and_size() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"f",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        write(&rt, &created.cap, 0, b"0123456789").unwrap();
        let attr = setattr(
            &rt,
            &created.file,
            &Sattr {
                mode: 0o600,
                size: 4,
                ..Sattr::default()
            },
        )
        .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(attr.mode & 0o777, 0o600);
        // Versions move forward on every mutation.
        assert!(attr.version > created.attr.version);
    }

    #[test]
    fn md5sum_of_chunks() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"sums",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        write(&rt, &created.cap, 0, b"abcdef").unwrap();
        let args = Md5SumArgs {
            cap: created.cap,
            offsets: vec![0, 3],
            lengths: vec![3, 3],
        };
        let res = md5sum(&rt, &args).unwrap();
        assert_eq!(res.size, 6);
        assert_eq!(res.lengths, vec![3, 3]);
        let mut hasher = Md5::new();
        hasher.update(b"abc");
        let expected: [u8; 16] = hasher.finalize().into();
        assert_eq!(res.digests[0], expected);
    }

    #[test]
    fn file_info_returns_volume_relative_path() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let sub = mkdir(&rt, &dir_fh, b"sub", &Sattr::default()).unwrap();
        let created = create(
            &rt,
            &sub.file,
            b"leaf",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        assert_eq!(file_info(&rt, &created.file).unwrap(), b"/sub/leaf".to_vec());
        assert_eq!(file_info(&rt, &dir_fh).unwrap(), b"/".to_vec());
    }

    #[test]
    fn forget_balances_lookups() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"f",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        close(&rt, &created.cap).unwrap();
        lookup(&rt, &dir_fh, b"f").unwrap();
        lookup(&rt, &dir_fh, b"f").unwrap();
        // create + two lookups
        assert_eq!(rt.tables.nlookup(&created.file), 3);
        forget(&rt, &created.file, 3);
        assert_eq!(rt.tables.nlookup(&created.file), 0);
    }

    #[test]
    fn xattr_cycle() {
        let (_dir, rt) = local_rt();
        let dir_fh = home_root(&rt).file;
        let created = create(
            &rt,
            &dir_fh,
            b"x",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        close(&rt, &created.cap).unwrap();
        // tmpfs or restricted filesystems may refuse user xattrs; accept
        // OpNotSupp and bail out in that case.
        match setxattr(&rt, &created.file, b"user.test", b"v1", 0) {
            Ok(()) => {}
            Err(ZfsError::OpNotSupp) | Err(ZfsError::Perm) => return,
            Err(other) => panic!("setxattr: {other}"),
        }
        assert_eq!(getxattr(&rt, &created.file, b"user.test").unwrap(), b"v1");
        let list = listxattr(&rt, &created.file).unwrap();
        assert!(list.windows(9).any(|w| w == b"user.test"));
        removexattr(&rt, &created.file, b"user.test").unwrap();
        assert_eq!(
            getxattr(&rt, &created.file, b"user.test").unwrap_err(),
            ZfsError::NoData
        );
    }

    #[test]
    fn writes_respect_volume_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            "nodeid 1\nnodename orion\nvolume 5 home /home 1 {} 16\n",
            dir.path().display()
        );
        let rt = Runtime::new(Config::parse(&text).unwrap()).unwrap();
        let dir_fh = volume_root(&rt, 5).unwrap().file;
        let created = create(
            &rt,
            &dir_fh,
            b"f",
            libc::O_RDWR as u32,
            &Sattr::default(),
        )
        .unwrap();
        write(&rt, &created.cap, 0, b"0123456789").unwrap();
        assert_eq!(
            write(&rt, &created.cap, 10, b"0123456789").unwrap_err(),
            ZfsError::NoSpc
        );
    }
}
