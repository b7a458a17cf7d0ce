//! 3GX plugin container format.
//!
//! A container starts with the 8 byte magic `"3GX$"` followed by four
//! ASCII digits giving the format version. The fixed header that
//! follows describes the executable segments, the symbol table, the
//! info strings (author, title...) and the list of target titles, all
//! referenced by file offsets. `read_header` relocates those offsets
//! into a caller-supplied tail buffer so the rest of the loader never
//! touches file offsets again.

use std::io::{Read, Seek, SeekFrom};

use error::{Error, ErrorKind};
use kernel::Kernel;

/// `"3GX$"` as a little endian word
pub const MAGIC: u32 = 0x2458_4733;

/// Magic plus the `"0001"` version digits supported by this loader
pub const FULL_MAGIC: u64 = 0x3130_3030_2458_4733;

/// Size of the fixed on-disk header
pub const HEADER_ON_DISK_SIZE: u64 = 0x5c;

/// Executable sub-header: segment sizes and file offsets
#[derive(Clone, Copy, Debug, Default)]
pub struct Executable {
    pub code_size: u32,
    pub code_offset: u32,
    pub rodata_size: u32,
    pub rodata_offset: u32,
    pub data_size: u32,
    pub data_offset: u32,
    pub bss_size: u32,
}

impl Executable {
    /// Total number of bytes read from the file for the load segments
    /// (bss is not stored)
    fn stored_size(&self) -> u64 {
        self.code_size as u64
            + self.rodata_size as u64
            + self.data_size as u64
    }
}

/// Symbol table sub-header. Carried along but never resolved by the
/// loader.
#[derive(Clone, Copy, Debug, Default)]
pub struct Symtable {
    pub nb_symbols: u32,
    pub symbols_offset: u32,
    pub name_table_offset: u32,
}

/// Info strings. On disk the `*_off` fields are file offsets, after
/// `read_header` they're offsets into the tail buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Infos {
    pub author_len: u32,
    pub author_off: u32,
    pub title_len: u32,
    pub title_off: u32,
    pub summary_len: u32,
    pub summary_off: u32,
    pub description_len: u32,
    pub description_off: u32,
}

/// Target title list. Same offset relocation as `Infos`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Targets {
    pub count: u32,
    pub titles_off: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Header {
    pub version: u32,
    pub executable: Executable,
    pub symtable: Symtable,
    pub infos: Infos,
    pub targets: Targets,
}

impl Header {
    /// Author string, looked up in the tail buffer filled by
    /// `read_header`
    pub fn author<'a>(&self, tail: &'a [u8]) -> &'a [u8] {
        let off = self.infos.author_off as usize;

        &tail[off..off + self.infos.author_len as usize]
    }

    /// Title string, looked up in the tail buffer filled by
    /// `read_header`
    pub fn title<'a>(&self, tail: &'a [u8]) -> &'a [u8] {
        let off = self.infos.title_off as usize;

        &tail[off..off + self.infos.title_len as usize]
    }

    /// Title ids this plugin declares itself compatible with. An empty
    /// list means "any title".
    pub fn target_titles(&self, tail: &[u8]) -> Vec<u32> {
        let off = self.targets.titles_off as usize;
        let count = self.targets.count as usize;

        (0..count)
            .map(|i| {
                let w = &tail[off + i * 4..off + i * 4 + 4];

                w[0] as u32
                    | (w[1] as u32) << 8
                    | (w[2] as u32) << 16
                    | (w[3] as u32) << 24
            })
            .collect()
    }

    pub fn is_compatible(&self, tail: &[u8], title: u32) -> bool {
        self.targets.count == 0
            || self.target_titles(tail).contains(&title)
    }
}

/// Check the container magic and version.
///
/// The low word must be `"3GX$"` exactly. The high word holds four
/// ASCII digits stored so that a byte swap makes them compare
/// lexicographically: a smaller value than ours means the plugin
/// predates the format we expect, a greater one means the loader is
/// the outdated party.
pub fn check_magic<R: Read + Seek>(r: &mut R) -> Result<(), Error> {
    r.seek(SeekFrom::Start(0))?;

    let magic = read_u64(r)?;

    if magic as u32 != MAGIC {
        return Err(Error::container(ErrorKind::InvalidContainer));
    }

    let file_version = ((magic >> 32) as u32).swap_bytes();
    let loader_version = ((FULL_MAGIC >> 32) as u32).swap_bytes();

    if file_version < loader_version {
        Err(Error::container(ErrorKind::PluginOutdated))
    } else if file_version > loader_version {
        Err(Error::container(ErrorKind::LoaderOutdated))
    } else {
        Ok(())
    }
}

/// Read the fixed header and relocate the variable-length parts into
/// `tail`: author bytes first, title right after, then the target
/// title words on the next 4 byte boundary. Summary and description
/// are dropped, the loader has no use for them.
pub fn read_header<R: Read + Seek>(r: &mut R, tail: &mut [u8])
                                   -> Result<Header, Error> {
    r.seek(SeekFrom::Start(0))?;

    // Fixed part. The magic has been validated by `check_magic`
    // already, only the version digits are kept.
    let magic = read_u64(r)?;

    let mut header = Header::default();

    header.version = read_u32(r)?;

    header.executable = Executable {
        code_size: read_u32(r)?,
        code_offset: read_u32(r)?,
        rodata_size: read_u32(r)?,
        rodata_offset: read_u32(r)?,
        data_size: read_u32(r)?,
        data_offset: read_u32(r)?,
        bss_size: read_u32(r)?,
    };

    header.symtable = Symtable {
        nb_symbols: read_u32(r)?,
        symbols_offset: read_u32(r)?,
        name_table_offset: read_u32(r)?,
    };

    header.infos = Infos {
        author_len: read_u32(r)?,
        author_off: read_u32(r)?,
        title_len: read_u32(r)?,
        title_off: read_u32(r)?,
        summary_len: read_u32(r)?,
        summary_off: read_u32(r)?,
        description_len: read_u32(r)?,
        description_off: read_u32(r)?,
    };

    header.targets = Targets {
        count: read_u32(r)?,
        titles_off: read_u32(r)?,
    };

    if magic as u32 != MAGIC {
        return Err(Error::container(ErrorKind::InvalidContainer));
    }

    let mut cursor = 0usize;

    // Author
    cursor = read_to_tail(r, tail, cursor,
                          header.infos.author_off,
                          header.infos.author_len)?;
    header.infos.author_off = 0;

    // Title
    let title_off = cursor;

    cursor = read_to_tail(r, tail, cursor,
                          header.infos.title_off,
                          header.infos.title_len)?;
    header.infos.title_off = title_off as u32;

    header.infos.summary_len = 0;
    header.infos.summary_off = 0;
    header.infos.description_len = 0;
    header.infos.description_off = 0;

    // Target titles, 4 byte aligned
    cursor = (cursor + 3) & !3;

    let titles_len =
        match header.targets.count.checked_mul(4) {
            Some(l) => l,
            None => return Err(malformed("target count overflow")),
        };

    read_to_tail(r, tail, cursor, header.targets.titles_off, titles_len)?;
    header.targets.titles_off = cursor as u32;

    Ok(header)
}

/// Seek to the file offset `off` and read `len` bytes at `tail[cursor]`,
/// returning the new cursor
fn read_to_tail<R: Read + Seek>(r: &mut R, tail: &mut [u8],
                                cursor: usize, off: u32, len: u32)
                                -> Result<usize, Error> {
    let len = len as usize;

    if cursor + len > tail.len() {
        return Err(malformed("info strings don't fit the tail buffer"));
    }

    r.seek(SeekFrom::Start(off as u64))?;
    r.read_exact(&mut tail[cursor..cursor + len])?;

    Ok(cursor + len)
}

/// Read the code, rodata and data segments into `dst` and run the
/// in-place decrypt stub over them. Whatever routine a container
/// patched into the stub, it is gone by the time we return: the stub
/// is rewritten to a plain return and the instruction cache
/// invalidated, so no decryption logic can outlive the load that
/// installed it.
pub fn read_load_segments<R, K>(r: &mut R, header: &Header,
                                dst: &mut [u8], stub: &mut DecryptStub,
                                kernel: &mut K) -> Result<(), Error>
    where R: Read + Seek, K: Kernel {

    let size = header.executable.stored_size();

    if size > dst.len() as u64 {
        return Err(malformed("load segments don't fit the arena"));
    }

    let size = size as usize;

    r.seek(SeekFrom::Start(header.executable.code_offset as u64))?;
    r.read_exact(&mut dst[..size])?;

    kernel.run_decrypt_stub(stub, &mut dst[..size]);
    stub.reset(kernel);

    Ok(())
}

fn malformed(what: &str) -> Error {
    Error::with_message(ErrorKind::Malformed, 0, what)
}

/// `bx lr`
const ARM_BX_LR: u32 = 0xe12f_ff1e;
/// `nop` (`mov r0, r0` encoding used by the toolchain)
const ARM_NOP: u32 = 0xe320_f000;

/// Number of instruction words in the decrypt stub
const STUB_WORDS: usize = 32;
/// Number of parameter words passed to the stub
const STUB_PARAMS: usize = 16;

/// The rewritable decrypt trampoline. Containers may ship a load-time
/// patch that installs a short routine (and its parameters) here; the
/// routine runs once over the freshly read segments with loader
/// privileges, which is why `reset` must put the stub back to a
/// return-only function before the next load.
pub struct DecryptStub {
    code: [u32; STUB_WORDS],
    params: [u32; STUB_PARAMS],
}

impl DecryptStub {
    pub fn new() -> DecryptStub {
        DecryptStub {
            code: identity_code(),
            params: [0; STUB_PARAMS],
        }
    }

    /// Install a routine, the way a container load-time patch does
    pub fn install(&mut self, code: [u32; STUB_WORDS],
                   params: [u32; STUB_PARAMS]) {
        self.code = code;
        self.params = params;
    }

    /// True if the stub is the return-only function
    pub fn is_identity(&self) -> bool {
        self.code == identity_code()
            && self.params.iter().all(|&p| p == 0)
    }

    pub fn params(&self) -> &[u32; STUB_PARAMS] {
        &self.params
    }

    /// Rewrite the stub to `bx lr` followed by NOPs, clear the
    /// parameters and invalidate the instruction cache
    pub fn reset<K: Kernel>(&mut self, kernel: &mut K) {
        self.code = identity_code();
        self.params = [0; STUB_PARAMS];

        kernel.invalidate_instruction_cache();
    }
}

fn identity_code() -> [u32; STUB_WORDS] {
    let mut code = [ARM_NOP; STUB_WORDS];

    code[0] = ARM_BX_LR;

    code
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, ::std::io::Error> {
    let mut b = [0; 4];

    r.read_exact(&mut b)?;

    Ok(b[0] as u32
       | (b[1] as u32) << 8
       | (b[2] as u32) << 16
       | (b[3] as u32) << 24)
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, ::std::io::Error> {
    let lo = read_u32(r)?;
    let hi = read_u32(r)?;

    Ok(lo as u64 | (hi as u64) << 32)
}
