//! The plugin memory arena: a fixed 5 MiB linear block holding the
//! plugin header, its executable image and its heap.
//!
//! The block is carved out of the app region on the more capable
//! console model (without shrinking the heap the game is about to
//! commit to) and out of the system region on the base model. While a
//! plugin runs the block is mapped into the target process; during
//! sleep swaps it is written out to a file on the SD card and the
//! physical memory is handed back.

use std::io::Read;

use error::{Error, ErrorKind};
use kernel::{map, sysinfo, Handle, KError, Kernel, CUR_PROCESS_HANDLE};
use kernel::{MEMOP_ALLOC, MEMOP_FREE, MEMOP_LINEAR_FLAG};
use kernel::{MEMOP_REGION_APP, MEMOP_REGION_SYSTEM, MEMPERM_RW};
use sdmc::Sdmc;

/// Size of the arena
pub const ARENA_SIZE: usize = 5 * 1024 * 1024;

/// Swap file holding the arena contents while the plugin is evicted.
/// Always exactly `ARENA_SIZE` bytes.
pub const SWAP_PATH: &'static str = "/luma/plugins/.swap";

/// Size of the in-arena plugin header
pub const PLUGIN_HEADER_SIZE: usize = 0x100;

/// `"3GX$"`, same tag as the container magic
pub const PLUGIN_HEADER_MAGIC: u32 = 0x2458_4733;

/// Result code reported when the app region can't spare the arena
const ERR_NO_APP_MEMORY: u32 = 0xd860_180a;

/// Header written at offset 0 of the arena and visible to the plugin
/// at its well-known address. Fixed fields live in the first 0x20
/// bytes, the 128 byte config area sits at offset 0x80, reserved
/// words pad the gap.
#[derive(Clone, Copy, Debug)]
pub struct PluginHeader {
    pub magic: u32,
    pub version: u32,
    pub exe_size: u32,
    pub heap_va: u32,
    pub heap_size: u32,
    pub is_default_plugin: u32,
    /// Physical address of the rendezvous event word
    pub event_pa: u32,
    /// Physical address of the rendezvous reply word
    pub reply_pa: u32,
    pub config: [u32; 32],
}

impl PluginHeader {
    pub fn new() -> PluginHeader {
        PluginHeader {
            magic: PLUGIN_HEADER_MAGIC,
            version: 0,
            exe_size: 0,
            heap_va: 0,
            heap_size: 0,
            is_default_plugin: 0,
            event_pa: 0,
            reply_pa: 0,
            config: [0; 32],
        }
    }

    /// Serialize into the first `PLUGIN_HEADER_SIZE` bytes of `dst`
    pub fn write_to(&self, dst: &mut [u8]) {
        for b in dst[..PLUGIN_HEADER_SIZE].iter_mut() {
            *b = 0;
        }

        let fixed = [self.magic, self.version, self.exe_size,
                     self.heap_va, self.heap_size,
                     self.is_default_plugin,
                     self.event_pa, self.reply_pa];

        for (i, &w) in fixed.iter().enumerate() {
            put_word(dst, i * 4, w);
        }

        for (i, &w) in self.config.iter().enumerate() {
            put_word(dst, 0x80 + i * 4, w);
        }
    }

    pub fn read_from(src: &[u8]) -> PluginHeader {
        let mut header = PluginHeader::new();

        header.magic = get_word(src, 0x00);
        header.version = get_word(src, 0x04);
        header.exe_size = get_word(src, 0x08);
        header.heap_va = get_word(src, 0x0c);
        header.heap_size = get_word(src, 0x10);
        header.is_default_plugin = get_word(src, 0x14);
        header.event_pa = get_word(src, 0x18);
        header.reply_pa = get_word(src, 0x1c);

        for i in 0..32 {
            header.config[i] = get_word(src, 0x80 + i * 4);
        }

        header
    }
}

pub struct MemoryArena {
    /// Backing block. `None` while the arena is absent or swapped
    /// out.
    block: Option<Box<[u8; ARENA_SIZE]>>,
    /// True on the console model with the larger app region
    is_n3ds: bool,
}

impl MemoryArena {
    pub fn new(is_n3ds: bool) -> MemoryArena {
        MemoryArena {
            block: None,
            is_n3ds: is_n3ds,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.block.is_some()
    }

    /// Allocate the arena. A no-op if it is already there.
    ///
    /// On the capable model the app region has to keep feeding the
    /// game, so the sequence is: debit the app-memory-allocation cell
    /// if it still advertises the whole region, pin the game heap
    /// layout by reserving everything that would remain after the
    /// arena, carve the arena, release the reserve.
    pub fn acquire<K: Kernel>(&mut self, kernel: &mut K)
                              -> Result<(), Error> {
        if self.block.is_some() {
            return Ok(());
        }

        let res =
            if self.is_n3ds {
                self.acquire_app_region(kernel)
            } else {
                kernel.control_memory(map::ARENA_VA, ARENA_SIZE as u32,
                                      MEMOP_REGION_SYSTEM | MEMOP_ALLOC
                                      | MEMOP_LINEAR_FLAG,
                                      MEMPERM_RW)
                    .map(|_| ())
            };

        match res {
            Ok(()) => {
                self.block = Some(alloc_block());

                Ok(())
            }
            Err(KError(code)) => {
                warn!("arena allocation failed: 0x{:08x}", code);

                Err(Error::with_message(ErrorKind::OutOfMemory, code,
                                        "Couldn't allocate memblock"))
            }
        }
    }

    fn acquire_app_region<K: Kernel>(&mut self, kernel: &mut K)
                                     -> Result<(), KError> {
        let (ty, param) = sysinfo::APP_REGION_SIZE;
        let app_size = kernel.get_system_info(ty, param);

        let (ty, param) = sysinfo::APP_REGION_USED;
        let app_used = kernel.get_system_info(ty, param);

        let app_free = (app_size - app_used) as u32;

        if (app_free as usize) < ARENA_SIZE {
            return Err(KError(ERR_NO_APP_MEMORY));
        }

        // If the allocation cell still reports the entire region,
        // remove the plugin share so the game sizes its heap without
        // us
        let app_alloc = kernel.read_pa(map::APP_MEM_ALLOC_PA);

        if app_size as u32 == app_alloc {
            kernel.write_pa(map::APP_MEM_ALLOC_PA,
                            app_alloc - ARENA_SIZE as u32);
        }

        let reserve_size = app_free - ARENA_SIZE as u32;

        // Pin the game heap layout first
        let reserve = kernel.control_memory(map::HEAP_RESERVE_VA,
                                            reserve_size,
                                            MEMOP_REGION_APP | MEMOP_ALLOC
                                            | MEMOP_LINEAR_FLAG,
                                            MEMPERM_RW)?;

        // Then carve the arena itself
        let res = kernel.control_memory(map::ARENA_VA, ARENA_SIZE as u32,
                                        MEMOP_REGION_APP | MEMOP_ALLOC
                                        | MEMOP_LINEAR_FLAG,
                                        MEMPERM_RW);

        // And release the reserve either way
        let _ = kernel.control_memory(reserve, reserve_size,
                                      MEMOP_FREE, 0);

        res.map(|_| ())
    }

    /// Free the backing region. Tolerates an absent arena.
    pub fn release<K: Kernel>(&mut self, kernel: &mut K)
                              -> Result<(), Error> {
        if self.block.is_none() {
            return Ok(());
        }

        let region =
            if self.is_n3ds {
                MEMOP_REGION_APP
            } else {
                MEMOP_REGION_SYSTEM
            };

        let res = kernel.control_memory(map::ARENA_VA, ARENA_SIZE as u32,
                                        region | MEMOP_FREE, 0);

        self.block = None;

        res.map(|_| ()).map_err(|KError(code)| {
            Error::with_message(ErrorKind::Unknown, code,
                                "Couldn't free memblock")
        })
    }

    /// Map the executable window at the arena address and the heap
    /// window at the plugin heap address inside `target`. No rollback
    /// on failure: the caller unmounts (unmapping an unmapped range
    /// is tolerated) before releasing.
    pub fn mount_in<K: Kernel>(&self, kernel: &mut K, target: Handle,
                               header: &PluginHeader)
                               -> Result<(), Error> {
        kernel.map_process_memory(target, map::ARENA_VA,
                                  CUR_PROCESS_HANDLE, map::ARENA_VA,
                                  header.exe_size)
            .map_err(|KError(code)| {
                Error::with_message(ErrorKind::MapFailure, code,
                                    "Couldn't map exe memory block")
            })?;

        kernel.map_process_memory(target, header.heap_va,
                                  CUR_PROCESS_HANDLE,
                                  map::ARENA_VA + header.exe_size,
                                  header.heap_size)
            .map_err(|KError(code)| {
                Error::with_message(ErrorKind::MapFailure, code,
                                    "Couldn't map heap memory block")
            })
    }

    /// Unmap both windows from `target`, reporting the failures of
    /// both attempts combined
    pub fn unmount_from<K: Kernel>(&self, kernel: &mut K, target: Handle,
                                   header: &PluginHeader)
                                   -> Result<(), KError> {
        let mut code = 0;

        if let Err(KError(c)) = kernel.unmap_process_memory(
            target, map::ARENA_VA, header.exe_size) {
            code |= c;
        }

        if let Err(KError(c)) = kernel.unmap_process_memory(
            target, header.heap_va, header.heap_size) {
            code |= c;
        }

        if code == 0 {
            Ok(())
        } else {
            Err(KError(code))
        }
    }

    /// Write the arena out to the swap file. Any failure here is
    /// fatal: continuing with a bad swap file would desynchronize the
    /// plugin state on the next reload.
    pub fn to_swap<K: Kernel>(&mut self, kernel: &mut K, sdmc: &Sdmc) {
        use std::io::Write;

        let block = match self.block {
            Some(ref b) => b,
            None => panic!("swapping out an absent arena"),
        };

        kernel.flush_data_cache_range(block.as_ptr() as usize,
                                      ARENA_SIZE);

        let mut file = match sdmc.create(SWAP_PATH) {
            Ok(f) => f,
            Err(e) => panic!("couldn't open the swap file: {}", e),
        };

        if let Err(e) = file.write_all(&block[..]) {
            panic!("couldn't write the swap file: {}", e);
        }

        if let Err(e) = file.sync_data() {
            panic!("couldn't flush the swap file: {}", e);
        }
    }

    /// Read the arena back from the swap file. Same fatality rules as
    /// `to_swap`, and only legal between `acquire` and `mount_in`.
    pub fn from_swap<K: Kernel>(&mut self, kernel: &mut K, sdmc: &Sdmc) {
        let block = match self.block {
            Some(ref mut b) => b,
            None => panic!("swapping in an absent arena"),
        };

        let mut file = match sdmc.open(SWAP_PATH) {
            Ok(f) => f,
            Err(e) => panic!("couldn't open the swap file: {}", e),
        };

        if let Err(e) = file.read_exact(&mut block[..]) {
            panic!("couldn't read the swap file back: {}", e);
        }

        kernel.flush_data_cache_range(block.as_ptr() as usize,
                                      ARENA_SIZE);
    }

    /// The backing bytes. Only meaningful while the loader owns the
    /// arena, i.e. between `acquire` and `mount_in`.
    pub fn block_mut(&mut self) -> &mut [u8] {
        match self.block {
            Some(ref mut b) => &mut b[..],
            None => panic!("the arena is absent"),
        }
    }

    pub fn block(&self) -> &[u8] {
        match self.block {
            Some(ref b) => &b[..],
            None => panic!("the arena is absent"),
        }
    }
}

/// Allocate the zeroed backing block directly on the heap. Going
/// through a boxed slice keeps the 5 MiB array off the stack at the
/// construction site.
fn alloc_block() -> Box<[u8; ARENA_SIZE]> {
    let boxed_slice = vec![0u8; ARENA_SIZE].into_boxed_slice();

    let ptr = Box::into_raw(boxed_slice) as *mut [u8; ARENA_SIZE];

    unsafe { Box::from_raw(ptr) }
}

fn put_word(buf: &mut [u8], offset: usize, val: u32) {
    for i in 0..4 {
        buf[offset + i] = (val >> (i * 8)) as u8;
    }
}

fn get_word(buf: &[u8], offset: usize) -> u32 {
    buf[offset] as u32
        | (buf[offset + 1] as u32) << 8
        | (buf[offset + 2] as u32) << 16
        | (buf[offset + 3] as u32) << 24
}
