//! Protocol types shared by the kernel channel and the peer network.
//!
//! The field order of every compound type is fixed by the wire format; the
//! encode/decode pairs below go through the aligned codec in [`crate::codec`].
//! Variable-length fields decode as slices borrowing the frame.

use std::fmt;
use std::io;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::codec::{
    CodecError, DataCoder, FrameReader, MAX_DATA, MAX_MD5_CHUNKS, MAX_NAME, MAX_NODE, MAX_PATH,
    MD5_SIZE, VERIFY_LEN,
};

/// Node id used for the virtual directory tree.
pub const VIRTUAL_SID: u32 = 0;
/// Volume id used for the virtual directory tree.
pub const VIRTUAL_VID: u32 = 0;

/// Wildcard uid/gid sent for identities with no mapping on the peer.
pub const WILDCARD_ID: u32 = u32::MAX;

/// File handle: the immutable identifier of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ZfsFh {
    /// Id of the node hosting the object.
    pub sid: u32,
    /// Id of the volume the object lives on.
    pub vid: u32,
    /// Device of the underlying filesystem.
    pub dev: u32,
    /// Inode number on the underlying filesystem.
    pub ino: u32,
    /// Generation guarding against inode reuse.
    pub generation: u32,
}

impl ZfsFh {
    /// True for handles fabricated for the virtual tree.
    pub fn is_virtual(&self) -> bool {
        self.sid == VIRTUAL_SID && self.vid == VIRTUAL_VID
    }

    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.sid)?;
        dc.encode_u32(self.vid)?;
        dc.encode_u32(self.dev)?;
        dc.encode_u32(self.ino)?;
        dc.encode_u32(self.generation)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(ZfsFh {
            sid: r.read_u32()?,
            vid: r.read_u32()?,
            dev: r.read_u32()?,
            ino: r.read_u32()?,
            generation: r.read_u32()?,
        })
    }
}

impl fmt::Display for ZfsFh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{},{}]",
            self.sid, self.vid, self.dev, self.ino, self.generation
        )
    }
}

/// File type carried in attributes and mknod requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Default)]
#[repr(u8)]
pub enum FType {
    #[default]
    Bad = 0,
    Reg = 1,
    Dir = 2,
    Lnk = 3,
    Blk = 4,
    Chr = 5,
    Sock = 6,
    Fifo = 7,
}

impl FType {
    pub fn encode(self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u8(self.into())
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        FType::try_from(r.read_u8()?).map_err(|_| CodecError::BadEnum)
    }

    /// Translate a unix mode word to the wire file type.
    pub fn from_mode(mode: u32) -> FType {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FType::Reg,
            libc::S_IFDIR => FType::Dir,
            libc::S_IFLNK => FType::Lnk,
            libc::S_IFBLK => FType::Blk,
            libc::S_IFCHR => FType::Chr,
            libc::S_IFSOCK => FType::Sock,
            libc::S_IFIFO => FType::Fifo,
            _ => FType::Bad,
        }
    }
}

/// Link speed hint negotiated in the second auth stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Default)]
#[repr(u8)]
pub enum ConnectionSpeed {
    #[default]
    None = 0,
    Slow = 1,
    Fast = 2,
}

impl ConnectionSpeed {
    pub fn encode(self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u8(self.into())
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        ConnectionSpeed::try_from(r.read_u8()?).map_err(|_| CodecError::BadEnum)
    }
}

/// File attributes, produced fresh by every mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fattr {
    pub dev: u32,
    pub ino: u32,
    pub version: u64,
    pub ftype: FType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl Fattr {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.dev)?;
        dc.encode_u32(self.ino)?;
        dc.encode_u64(self.version)?;
        self.ftype.encode(dc)?;
        dc.encode_u32(self.mode)?;
        dc.encode_u32(self.nlink)?;
        dc.encode_u32(self.uid)?;
        dc.encode_u32(self.gid)?;
        dc.encode_u32(self.rdev)?;
        dc.encode_u64(self.size)?;
        dc.encode_u64(self.blocks)?;
        dc.encode_u32(self.blksize)?;
        dc.encode_u32(self.atime)?;
        dc.encode_u32(self.mtime)?;
        dc.encode_u32(self.ctime)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(Fattr {
            dev: r.read_u32()?,
            ino: r.read_u32()?,
            version: r.read_u64()?,
            ftype: FType::decode(r)?,
            mode: r.read_u32()?,
            nlink: r.read_u32()?,
            uid: r.read_u32()?,
            gid: r.read_u32()?,
            rdev: r.read_u32()?,
            size: r.read_u64()?,
            blocks: r.read_u64()?,
            blksize: r.read_u32()?,
            atime: r.read_u32()?,
            mtime: r.read_u32()?,
            ctime: r.read_u32()?,
        })
    }
}

/// Settable attributes. `u32::MAX` (and `u64::MAX` for the size) mean
/// "leave unchanged".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sattr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
}

impl Default for Sattr {
    fn default() -> Self {
        Sattr {
            mode: u32::MAX,
            uid: u32::MAX,
            gid: u32::MAX,
            size: u64::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
        }
    }
}

impl Sattr {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.mode)?;
        dc.encode_u32(self.uid)?;
        dc.encode_u32(self.gid)?;
        dc.encode_u64(self.size)?;
        dc.encode_u32(self.atime)?;
        dc.encode_u32(self.mtime)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(Sattr {
            mode: r.read_u32()?,
            uid: r.read_u32()?,
            gid: r.read_u32()?,
            size: r.read_u64()?,
            atime: r.read_u32()?,
            mtime: r.read_u32()?,
        })
    }
}

/// Capability: bearer token authorizing I/O on an open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZfsCap {
    pub fh: ZfsFh,
    pub flags: u32,
    pub verify: [u8; VERIFY_LEN],
}

impl ZfsCap {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.fh.encode(dc)?;
        dc.encode_u32(self.flags)?;
        dc.encode_fixed(&self.verify)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        let fh = ZfsFh::decode(r)?;
        let flags = r.read_u32()?;
        let mut verify = [0u8; VERIFY_LEN];
        verify.copy_from_slice(r.read_fixed(VERIFY_LEN)?);
        Ok(ZfsCap { fh, flags, verify })
    }
}

/// Errors carried in reply envelopes. POSIX values travel as positive
/// errnos; protocol conditions use the negative range. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ZfsError {
    Perm = libc::EPERM,
    NoEnt = libc::ENOENT,
    Intr = libc::EINTR,
    Io = libc::EIO,
    BadF = libc::EBADF,
    Access = libc::EACCES,
    Busy = libc::EBUSY,
    Exist = libc::EEXIST,
    XDev = libc::EXDEV,
    NoDev = libc::ENODEV,
    NotDir = libc::ENOTDIR,
    IsDir = libc::EISDIR,
    Inval = libc::EINVAL,
    TxtBsy = libc::ETXTBSY,
    FBig = libc::EFBIG,
    NoSpc = libc::ENOSPC,
    RoFs = libc::EROFS,
    NameTooLong = libc::ENAMETOOLONG,
    NoSys = libc::ENOSYS,
    NotEmpty = libc::ENOTEMPTY,
    OpNotSupp = libc::EOPNOTSUPP,
    NoData = libc::ENODATA,
    /// The file handle or dentry no longer matches the object.
    Stale = -5,
    /// The daemon is shutting down.
    Exiting = -6,
    /// A peer reply could not be decoded.
    InvalidReply = -7,
    /// The peer connection was torn down with requests in flight.
    ConnectionLost = -8,
    /// The request deadline expired.
    Timeout = -9,
}

impl ZfsError {
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    /// Interpret an error word from a reply envelope. Zero is success;
    /// unknown values collapse to [`ZfsError::InvalidReply`].
    pub fn from_wire(code: i32) -> Result<(), ZfsError> {
        match code {
            0 => Ok(()),
            libc::EPERM => Err(ZfsError::Perm),
            libc::ENOENT => Err(ZfsError::NoEnt),
            libc::EINTR => Err(ZfsError::Intr),
            libc::EIO => Err(ZfsError::Io),
            libc::EBADF => Err(ZfsError::BadF),
            libc::EACCES => Err(ZfsError::Access),
            libc::EBUSY => Err(ZfsError::Busy),
            libc::EEXIST => Err(ZfsError::Exist),
            libc::EXDEV => Err(ZfsError::XDev),
            libc::ENODEV => Err(ZfsError::NoDev),
            libc::ENOTDIR => Err(ZfsError::NotDir),
            libc::EISDIR => Err(ZfsError::IsDir),
            libc::EINVAL => Err(ZfsError::Inval),
            libc::ETXTBSY => Err(ZfsError::TxtBsy),
            libc::EFBIG => Err(ZfsError::FBig),
            libc::ENOSPC => Err(ZfsError::NoSpc),
            libc::EROFS => Err(ZfsError::RoFs),
            libc::ENAMETOOLONG => Err(ZfsError::NameTooLong),
            libc::ENOSYS => Err(ZfsError::NoSys),
            libc::ENOTEMPTY => Err(ZfsError::NotEmpty),
            libc::EOPNOTSUPP => Err(ZfsError::OpNotSupp),
            libc::ENODATA => Err(ZfsError::NoData),
            -5 => Err(ZfsError::Stale),
            -6 => Err(ZfsError::Exiting),
            -7 => Err(ZfsError::InvalidReply),
            -8 => Err(ZfsError::ConnectionLost),
            -9 => Err(ZfsError::Timeout),
            _ => Err(ZfsError::InvalidReply),
        }
    }
}

impl fmt::Display for ZfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZfsError::Stale => write!(f, "stale file handle"),
            ZfsError::Exiting => write!(f, "daemon exiting"),
            ZfsError::InvalidReply => write!(f, "invalid reply"),
            ZfsError::ConnectionLost => write!(f, "connection lost"),
            ZfsError::Timeout => write!(f, "request timed out"),
            other => write!(f, "{}", io::Error::from_raw_os_error(other.to_wire())),
        }
    }
}

impl std::error::Error for ZfsError {}

impl From<io::Error> for ZfsError {
    fn from(err: io::Error) -> ZfsError {
        match err.raw_os_error() {
            Some(code) => match ZfsError::from_wire(code) {
                Err(e) if e != ZfsError::InvalidReply => e,
                _ => ZfsError::Io,
            },
            None => ZfsError::Io,
        }
    }
}

impl From<CodecError> for ZfsError {
    fn from(_: CodecError) -> ZfsError {
        ZfsError::Inval
    }
}

impl From<nix::errno::Errno> for ZfsError {
    fn from(err: nix::errno::Errno) -> ZfsError {
        match ZfsError::from_wire(err as i32) {
            Err(e) if e != ZfsError::InvalidReply => e,
            _ => ZfsError::Io,
        }
    }
}

pub type ZfsResult<T> = Result<T, ZfsError>;

/// Operation codes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Null = 0,
    Ping = 1,
    Root = 2,
    VolumeRoot = 3,
    GetAttr = 4,
    SetAttr = 5,
    Lookup = 6,
    Create = 7,
    Open = 8,
    Close = 9,
    ReadDir = 10,
    Mkdir = 11,
    Rmdir = 12,
    Mknod = 13,
    Link = 14,
    Unlink = 15,
    Symlink = 16,
    ReadLink = 17,
    Rename = 18,
    Read = 19,
    Write = 20,
    Md5Sum = 21,
    FileInfo = 22,
    AuthStage1 = 23,
    AuthStage2 = 24,
    Forget = 25,
    SetXattr = 26,
    GetXattr = 27,
    ListXattr = 28,
    RemoveXattr = 29,
}

/// Request envelope following the frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub opcode: u32,
    pub from_sid: u32,
}

impl RequestHeader {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.request_id)?;
        dc.encode_u32(self.opcode)?;
        dc.encode_u32(self.from_sid)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(RequestHeader {
            request_id: r.read_u32()?,
            opcode: r.read_u32()?,
            from_sid: r.read_u32()?,
        })
    }

    pub fn opcode(&self) -> Result<Opcode, CodecError> {
        Opcode::try_from(self.opcode).map_err(|_| CodecError::BadEnum)
    }
}

/// Reply envelope following the frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub request_id: u32,
    pub error: i32,
}

impl ReplyHeader {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.request_id)?;
        dc.encode_i32(self.error)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(ReplyHeader {
            request_id: r.read_u32()?,
            error: r.read_i32()?,
        })
    }
}

/// Read a name component and validate its bounds.
pub fn decode_filename<'a>(r: &mut FrameReader<'a>) -> Result<&'a [u8], CodecError> {
    r.read_str(MAX_NAME)
}

/// Read a path and validate its bound.
pub fn decode_path<'a>(r: &mut FrameReader<'a>) -> Result<&'a [u8], CodecError> {
    r.read_str(MAX_PATH)
}

/// Read a node name and validate its bound.
pub fn decode_nodename<'a>(r: &mut FrameReader<'a>) -> Result<&'a [u8], CodecError> {
    r.read_str(MAX_NODE)
}

/// Directory + name argument pair used by name-keyed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirOpArgs<'a> {
    pub dir: ZfsFh,
    pub name: &'a [u8],
}

impl<'a> DirOpArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.dir.encode(dc)?;
        dc.encode_str(self.name)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(DirOpArgs {
            dir: ZfsFh::decode(r)?,
            name: decode_filename(r)?,
        })
    }
}

/// Result of operations that resolve a name: the handle and fresh
/// attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirOpRes {
    pub file: ZfsFh,
    pub attr: Fattr,
}

impl DirOpRes {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.file.encode(dc)?;
        self.attr.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(DirOpRes {
            file: ZfsFh::decode(r)?,
            attr: Fattr::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SattrArgs {
    pub file: ZfsFh,
    pub attr: Sattr,
}

impl SattrArgs {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.file.encode(dc)?;
        self.attr.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(SattrArgs {
            file: ZfsFh::decode(r)?,
            attr: Sattr::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CreateArgs<'a> {
    pub location: DirOpArgs<'a>,
    pub flags: u32,
    pub attr: Sattr,
}

impl<'a> CreateArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.location.encode(dc)?;
        dc.encode_u32(self.flags)?;
        self.attr.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(CreateArgs {
            location: DirOpArgs::decode(r)?,
            flags: r.read_u32()?,
            attr: Sattr::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CreateRes {
    pub cap: ZfsCap,
    pub file: ZfsFh,
    pub attr: Fattr,
}

impl CreateRes {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.cap.encode(dc)?;
        self.file.encode(dc)?;
        self.attr.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(CreateRes {
            cap: ZfsCap::decode(r)?,
            file: ZfsFh::decode(r)?,
            attr: Fattr::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpenArgs {
    pub file: ZfsFh,
    pub flags: u32,
}

impl OpenArgs {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.file.encode(dc)?;
        dc.encode_u32(self.flags)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(OpenArgs {
            file: ZfsFh::decode(r)?,
            flags: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadDirArgs {
    pub cap: ZfsCap,
    pub cookie: i32,
    pub count: u32,
}

impl ReadDirArgs {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.cap.encode(dc)?;
        dc.encode_i32(self.cookie)?;
        dc.encode_u32(self.count)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(ReadDirArgs {
            cap: ZfsCap::decode(r)?,
            cookie: r.read_i32()?,
            count: r.read_u32()?,
        })
    }
}

/// One directory entry in a readdir page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    pub cookie: i32,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.ino)?;
        dc.encode_i32(self.cookie)?;
        dc.encode_str(&self.name)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(DirEntry {
            ino: r.read_u32()?,
            cookie: r.read_i32()?,
            name: decode_filename(r)?.to_vec(),
        })
    }
}

/// A readdir page: entry count, eof flag, then the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirList {
    pub eof: bool,
    pub entries: Vec<DirEntry>,
}

impl DirList {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        dc.encode_u32(self.entries.len() as u32)?;
        dc.encode_u8(self.eof as u8)?;
        for entry in &self.entries {
            entry.encode(dc)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        let n = r.read_u32()?;
        let eof = match r.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(CodecError::BadEnum),
        };
        if n as usize > MAX_DATA / 8 {
            return Err(CodecError::OverlongField);
        }
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            entries.push(DirEntry::decode(r)?);
        }
        Ok(DirList { eof, entries })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MkdirArgs<'a> {
    pub location: DirOpArgs<'a>,
    pub attr: Sattr,
}

impl<'a> MkdirArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.location.encode(dc)?;
        self.attr.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(MkdirArgs {
            location: DirOpArgs::decode(r)?,
            attr: Sattr::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenameArgs<'a> {
    pub from: DirOpArgs<'a>,
    pub to: DirOpArgs<'a>,
}

impl<'a> RenameArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.from.encode(dc)?;
        self.to.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(RenameArgs {
            from: DirOpArgs::decode(r)?,
            to: DirOpArgs::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkArgs<'a> {
    pub from: ZfsFh,
    pub to: DirOpArgs<'a>,
}

impl<'a> LinkArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.from.encode(dc)?;
        self.to.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(LinkArgs {
            from: ZfsFh::decode(r)?,
            to: DirOpArgs::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadArgs {
    pub cap: ZfsCap,
    pub offset: u64,
    pub count: u32,
}

impl ReadArgs {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.cap.encode(dc)?;
        dc.encode_u64(self.offset)?;
        dc.encode_u32(self.count)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(ReadArgs {
            cap: ZfsCap::decode(r)?,
            offset: r.read_u64()?,
            count: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteArgs<'a> {
    pub cap: ZfsCap,
    pub offset: u64,
    pub data: &'a [u8],
}

impl<'a> WriteArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.cap.encode(dc)?;
        dc.encode_u64(self.offset)?;
        dc.encode_data(self.data)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(WriteArgs {
            cap: ZfsCap::decode(r)?,
            offset: r.read_u64()?,
            data: r.read_data()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SymlinkArgs<'a> {
    pub from: DirOpArgs<'a>,
    pub to: &'a [u8],
    pub attr: Sattr,
}

impl<'a> SymlinkArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.from.encode(dc)?;
        dc.encode_str(self.to)?;
        self.attr.encode(dc)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(SymlinkArgs {
            from: DirOpArgs::decode(r)?,
            to: decode_path(r)?,
            attr: Sattr::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MknodArgs<'a> {
    pub location: DirOpArgs<'a>,
    pub attr: Sattr,
    pub ftype: FType,
    pub rdev: u32,
}

impl<'a> MknodArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.location.encode(dc)?;
        self.attr.encode(dc)?;
        self.ftype.encode(dc)?;
        dc.encode_u32(self.rdev)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(MknodArgs {
            location: DirOpArgs::decode(r)?,
            attr: Sattr::decode(r)?,
            ftype: FType::decode(r)?,
            rdev: r.read_u32()?,
        })
    }
}

/// MD5 digests over a list of chunks of an open file.
#[derive(Debug, Clone)]
pub struct Md5SumArgs {
    pub cap: ZfsCap,
    pub offsets: Vec<u64>,
    pub lengths: Vec<u32>,
}

impl Md5SumArgs {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        if self.offsets.len() != self.lengths.len() || self.offsets.len() > MAX_MD5_CHUNKS {
            return Err(CodecError::OverlongField);
        }
        self.cap.encode(dc)?;
        dc.encode_u32(self.offsets.len() as u32)?;
        for off in &self.offsets {
            dc.encode_u64(*off)?;
        }
        for len in &self.lengths {
            dc.encode_u32(*len)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        let cap = ZfsCap::decode(r)?;
        let count = r.read_u32()? as usize;
        if count > MAX_MD5_CHUNKS {
            return Err(CodecError::OverlongField);
        }
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(r.read_u64()?);
        }
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            lengths.push(r.read_u32()?);
        }
        Ok(Md5SumArgs {
            cap,
            offsets,
            lengths,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Md5SumRes {
    pub size: u64,
    pub offsets: Vec<u64>,
    pub lengths: Vec<u32>,
    pub digests: Vec<[u8; MD5_SIZE]>,
}

impl Md5SumRes {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        let count = self.offsets.len();
        if count != self.lengths.len() || count != self.digests.len() || count > MAX_MD5_CHUNKS {
            return Err(CodecError::OverlongField);
        }
        dc.encode_u32(count as u32)?;
        dc.encode_u64(self.size)?;
        for off in &self.offsets {
            dc.encode_u64(*off)?;
        }
        for len in &self.lengths {
            dc.encode_u32(*len)?;
        }
        for digest in &self.digests {
            dc.encode_fixed(digest)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        let count = r.read_u32()? as usize;
        if count > MAX_MD5_CHUNKS {
            return Err(CodecError::OverlongField);
        }
        let size = r.read_u64()?;
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(r.read_u64()?);
        }
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            lengths.push(r.read_u32()?);
        }
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            let mut digest = [0u8; MD5_SIZE];
            digest.copy_from_slice(r.read_fixed(MD5_SIZE)?);
            digests.push(digest);
        }
        Ok(Md5SumRes {
            size,
            offsets,
            lengths,
            digests,
        })
    }
}

/// Forget notification: the sender no longer caches `file`; `count`
/// balances that many successful lookups.
#[derive(Debug, Clone, Copy)]
pub struct ForgetArgs {
    pub file: ZfsFh,
    pub count: u32,
}

impl ForgetArgs {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.file.encode(dc)?;
        dc.encode_u32(self.count)
    }

    pub fn decode(r: &mut FrameReader<'_>) -> Result<Self, CodecError> {
        Ok(ForgetArgs {
            file: ZfsFh::decode(r)?,
            count: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetXattrArgs<'a> {
    pub file: ZfsFh,
    pub name: &'a [u8],
    pub value: &'a [u8],
    pub flags: u32,
}

impl<'a> SetXattrArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.file.encode(dc)?;
        dc.encode_str(self.name)?;
        dc.encode_data(self.value)?;
        dc.encode_u32(self.flags)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(SetXattrArgs {
            file: ZfsFh::decode(r)?,
            name: decode_filename(r)?,
            value: r.read_data()?,
            flags: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct XattrNameArgs<'a> {
    pub file: ZfsFh,
    pub name: &'a [u8],
}

impl<'a> XattrNameArgs<'a> {
    pub fn encode(&self, dc: &mut DataCoder) -> Result<(), CodecError> {
        self.file.encode(dc)?;
        dc.encode_str(self.name)
    }

    pub fn decode(r: &mut FrameReader<'a>) -> Result<Self, CodecError> {
        Ok(XattrNameArgs {
            file: ZfsFh::decode(r)?,
            name: decode_filename(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataCoder;

    fn round_trip<T>(
        value: &T,
        encode: impl Fn(&T, &mut DataCoder) -> Result<(), CodecError>,
        decode: impl for<'a> Fn(&mut FrameReader<'a>) -> Result<T, CodecError>,
    ) -> T {
        let mut dc = DataCoder::new();
        dc.start_encoding();
        encode(value, &mut dc).unwrap();
        let buf = dc.finish_encoding().to_vec();
        let mut r = FrameReader::new(&buf).unwrap();
        let decoded = decode(&mut r).unwrap();
        assert!(r.finished(), "payload not fully consumed");
        decoded
    }

    #[test]
    fn zfs_fh_wire_layout() {
        let fh = ZfsFh {
            sid: 1,
            vid: 2,
            dev: 3,
            ino: 4,
            generation: 5,
        };
        let mut dc = DataCoder::new();
        dc.start_encoding();
        fh.encode(&mut dc).unwrap();
        let buf = dc.finish_encoding().to_vec();
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[..4], &24u32.to_le_bytes());
        assert_eq!(
            &buf[4..],
            &[
                0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04,
                0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00
            ]
        );
        let mut r = FrameReader::new(&buf).unwrap();
        assert_eq!(ZfsFh::decode(&mut r).unwrap(), fh);
    }

    #[test]
    fn fattr_round_trip() {
        let attr = Fattr {
            dev: 9,
            ino: 10,
            version: 11,
            ftype: FType::Dir,
            mode: 0o755,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 4096,
            blocks: 8,
            blksize: 4096,
            atime: 100,
            mtime: 200,
            ctime: 300,
        };
        let got = round_trip(&attr, Fattr::encode, Fattr::decode);
        assert_eq!(got, attr);
    }

    #[test]
    fn cap_round_trip() {
        let cap = ZfsCap {
            fh: ZfsFh {
                sid: 1,
                vid: 2,
                dev: 3,
                ino: 4,
                generation: 5,
            },
            flags: libc::O_RDWR as u32,
            verify: [7u8; VERIFY_LEN],
        };
        let got = round_trip(&cap, ZfsCap::encode, ZfsCap::decode);
        assert_eq!(got, cap);
    }

    #[test]
    fn bad_ftype_is_bad_enum() {
        let mut dc = DataCoder::new();
        dc.start_encoding();
        dc.encode_u8(200).unwrap();
        let buf = dc.finish_encoding().to_vec();
        let mut r = FrameReader::new(&buf).unwrap();
        assert_eq!(FType::decode(&mut r), Err(CodecError::BadEnum));
    }

    #[test]
    fn dir_list_round_trip() {
        let list = DirList {
            eof: true,
            entries: vec![
                DirEntry {
                    ino: 1,
                    cookie: 1,
                    name: b"a".to_vec(),
                },
                DirEntry {
                    ino: 2,
                    cookie: 2,
                    name: b"bb".to_vec(),
                },
            ],
        };
        let got = round_trip(&list, DirList::encode, DirList::decode);
        assert_eq!(got, list);
    }

    #[test]
    fn md5_args_bounds() {
        let args = Md5SumArgs {
            cap: ZfsCap {
                fh: ZfsFh::default(),
                flags: 0,
                verify: [0; VERIFY_LEN],
            },
            offsets: vec![0; MAX_MD5_CHUNKS + 1],
            lengths: vec![0; MAX_MD5_CHUNKS + 1],
        };
        let mut dc = DataCoder::new();
        dc.start_encoding();
        assert_eq!(args.encode(&mut dc), Err(CodecError::OverlongField));
    }

    #[test]
    fn error_wire_round_trip() {
        for err in [
            ZfsError::NoEnt,
            ZfsError::Exist,
            ZfsError::Stale,
            ZfsError::Timeout,
            ZfsError::ConnectionLost,
            ZfsError::Exiting,
        ] {
            assert_eq!(ZfsError::from_wire(err.to_wire()), Err(err));
        }
        assert_eq!(ZfsError::from_wire(0), Ok(()));
        assert_eq!(ZfsError::from_wire(-1234), Err(ZfsError::InvalidReply));
    }

    #[test]
    fn io_error_maps_through_errno() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(ZfsError::from(err), ZfsError::NoEnt);
        let err = io::Error::new(io::ErrorKind::Other, "weird");
        assert_eq!(ZfsError::from(err), ZfsError::Io);
    }

    #[test]
    fn request_header_round_trip() {
        let hdr = RequestHeader {
            request_id: 77,
            opcode: Opcode::Lookup.into(),
            from_sid: 3,
        };
        let got = round_trip(&hdr, RequestHeader::encode, RequestHeader::decode);
        assert_eq!(got, hdr);
        assert_eq!(got.opcode().unwrap(), Opcode::Lookup);
    }
}
