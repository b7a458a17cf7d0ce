//! Kernel interface of the loader.
//!
//! The loader runs as a privileged service and talks to the kernel
//! through a fixed set of supervisor calls: memory control, cross
//! process mapping, address arbitration, ports/sessions and the
//! `reply-and-receive` primitive its main loop blocks in. All of it is
//! abstracted behind the `Kernel` trait so the core logic can be
//! driven by the real syscall layer on the console and by a scripted
//! fake in the test suite.

#[cfg(test)]
pub mod mock;

/// Kernel object handle. 0 is "no handle" throughout the loader.
pub type Handle = u32;

/// Pseudo handle for the current process
pub const CUR_PROCESS_HANDLE: Handle = 0xffff8001;

/// A raw kernel result code with the failure bit set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KError(pub u32);

/// Result code levels (bits 27-31)
pub const RL_PERMANENT: u32 = 27;
pub const RL_USAGE: u32 = 28;

/// Result code summaries (bits 21-26)
pub const RS_NOTFOUND: u32 = 4;
pub const RS_INVALIDARG: u32 = 7;

/// Result code module for the loader (bits 10-17)
pub const RM_LDR: u32 = 29;

/// Pack a result code from its level, summary, module and description
/// fields
pub fn make_result(level: u32, summary: u32,
                   module: u32, description: u32) -> u32 {
    (level << 27) | (summary << 21) | (module << 10) | description
}

/// `reply-and-receive` failure when the remote endpoint closed the
/// session. The loop recovers from this one, everything else is fatal.
pub const ERR_SESSION_CLOSED: u32 = 0xc920181a;

/// Memory operations for `control_memory`
pub const MEMOP_FREE: u32 = 1;
pub const MEMOP_ALLOC: u32 = 3;
pub const MEMOP_REGION_APP: u32 = 0x100;
pub const MEMOP_REGION_SYSTEM: u32 = 0x200;
pub const MEMOP_LINEAR_FLAG: u32 = 0x10000;

/// Memory permissions
pub const MEMPERM_READ: u32 = 1;
pub const MEMPERM_WRITE: u32 = 2;
pub const MEMPERM_RW: u32 = MEMPERM_READ | MEMPERM_WRITE;

/// Address arbitration modes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbitrationType {
    /// Wake up to `value` waiters on the address
    Signal = 0,
    /// Block while the word at the address is less than `value`, with
    /// a timeout
    WaitIfLessThanTimeout = 3,
}

/// Event reset behaviour
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetType {
    OneShot = 0,
    Sticky = 1,
}

/// `get_system_info` queries used by the loader
pub mod sysinfo {
    /// (type, param) for the total app memory region size
    pub const APP_REGION_SIZE: (u32, u32) = (0x10000, 6);
    /// (type, param) for the memory currently used in the app region
    pub const APP_REGION_USED: (u32, u32) = (0, 1);
    /// (type, param) for the loader configuration bits. Bit 0 is the
    /// "plugin loader enabled" flag.
    pub const LOADER_CONFIG: (u32, u32) = (0x10000, 0x102);
}

/// `set_kernel_state` operation registering an event handle for plugin
/// notifications (swap and process exit)
pub const STATE_REGISTER_PLG_EVENT: u32 = 0x10007;

pub mod map {
    //! Fixed addresses of the loader's world: the virtual layout
    //! shared with the plugin and the physically addressed
    //! configuration cells.

    /// Loader-side (and target-side) virtual address of the plugin
    /// memory block
    pub const ARENA_VA: u32 = 0x0700_0000;

    /// Virtual address of the plugin heap inside the target process
    pub const HEAP_VA: u32 = 0x0600_0000;

    /// Virtual address of the first instruction of the game
    pub const GAME_ENTRY_VA: u32 = 0x0010_0000;

    /// Scratch virtual address used to pin the game heap layout while
    /// carving the arena out of the app region
    pub const HEAP_RESERVE_VA: u32 = 0x3000_0000;

    /// Physical address of the cell advertising how much app memory
    /// the running application may allocate
    pub const APP_MEM_ALLOC_PA: u32 = 0x1ff8_0040;

    /// Physical address of the plugin status cell. Low 16 bits hold
    /// the plugin status, high 16 bits the pending kernel event.
    pub const PLG_STATUS_PA: u32 = 0x1ff8_00f0;

    /// Physical address of the notification LED color register
    pub const LED_REG_PA: u32 = 0x1020_2204;
}

pub mod ipc {
    //! IPC command buffer word encodings

    /// Build a command header from the command id and the normal /
    /// translate parameter word counts
    pub fn make_header(command: u32, normal: u32, translate: u32) -> u32 {
        (command << 16) | ((normal & 0x3f) << 6) | (translate & 0x3f)
    }

    /// Descriptor for a read/write buffer of `size` bytes
    pub fn desc_buffer(size: u32, rights: u32) -> u32 {
        (size << 4) | 0x8 | rights
    }

    /// Buffer rights: mapped read/write in the service
    pub const BUFFER_RW: u32 = 6;

    /// Descriptor for sharing `count` handles with the peer
    pub fn desc_shared_handles(count: u32) -> u32 {
        (count - 1) << 26
    }

    /// Byte length encoded in a static buffer descriptor
    pub fn static_buffer_size(desc: u32) -> u32 {
        desc >> 14
    }

    /// Reply header for a malformed or unknown request: no command id,
    /// a single result word
    pub fn error_reply(cmdbuf: &mut [u32; 64], code: u32) {
        cmdbuf[0] = make_header(0, 1, 0);
        cmdbuf[1] = code;
    }

    #[test]
    fn header_packing() {
        assert!(make_header(1, 0, 2) == 0x0001_0002);
        assert!(make_header(4, 2, 4) == 0x0004_0084);
        assert!(make_header(5, 1, 8) == 0x0005_0048);
        assert!(make_header(10, 0, 2) == 0x000a_0002);
    }

    #[test]
    fn buffer_descriptors() {
        // 255 byte RW buffer
        assert!(desc_buffer(255, BUFFER_RW) == 0xffe);
        assert!(desc_shared_handles(1) == 0);
        assert!(static_buffer_size(desc_static(0x40, 0)) == 0x40);
    }

    /// Descriptor for a static buffer of `size` bytes with the given
    /// buffer id. Only used by tests and the inspection tool, the
    /// service merely decodes the size on reception.
    pub fn desc_static(size: u32, id: u32) -> u32 {
        (size << 14) | (id << 10) | 0x2
    }
}

/// Supervisor call surface used by the loader.
///
/// Cache maintenance operations take loader virtual addresses as plain
/// `usize` since on the console they are just pointers into our own
/// address space.
pub trait Kernel {
    /// `svcGetSystemInfo` — only the queries in `sysinfo` are used
    fn get_system_info(&mut self, ty: u32, param: u32) -> i64;

    /// Read a word through its physical address (configuration cells
    /// and MMIO registers)
    fn read_pa(&mut self, pa: u32) -> u32;

    /// Write a word through its physical address
    fn write_pa(&mut self, pa: u32, val: u32);

    /// Translate a loader virtual address to a physical address
    fn pa_from_va(&mut self, va: usize) -> u32;

    /// Allocate or free memory in our address space. Returns the
    /// address of the block.
    fn control_memory(&mut self, va: u32, size: u32, op: u32, perm: u32)
                      -> Result<u32, KError>;

    /// Map `size` bytes of `src_process` memory at `src_va` into
    /// `process` at `dst_va`
    fn map_process_memory(&mut self, process: Handle, dst_va: u32,
                          src_process: Handle, src_va: u32, size: u32)
                          -> Result<(), KError>;

    /// Undo a `map_process_memory`
    fn unmap_process_memory(&mut self, process: Handle, va: u32, size: u32)
                            -> Result<(), KError>;

    /// Read a word at a loader virtual address (used on the game page
    /// while it's mapped into our address space)
    fn read_word(&mut self, va: u32) -> u32;

    /// Write a word at a loader virtual address
    fn write_word(&mut self, va: u32, val: u32);

    fn flush_data_cache_range(&mut self, va: usize, len: usize);

    fn flush_entire_data_cache(&mut self);

    fn invalidate_instruction_cache(&mut self);

    /// Title id of the program running in `process`
    fn get_process_title_id(&mut self, process: Handle)
                            -> Result<u64, KError>;

    /// Switch the whole process MMU mapping to read/write/execute
    fn set_process_mmu_rwx(&mut self, process: Handle)
                           -> Result<(), KError>;

    /// Ask the kernel to notify us when the process is about to be
    /// terminated
    fn signal_on_exit(&mut self, process: Handle) -> Result<(), KError>;

    /// Lock or unlock scheduling of the process threads whose thread
    /// local storage starts with `tls_magic`
    fn schedule_threads(&mut self, process: Handle, lock: bool,
                        tls_magic: u32) -> Result<(), KError>;

    fn create_address_arbiter(&mut self) -> Result<Handle, KError>;

    fn arbitrate_address(&mut self, arbiter: Handle, addr: u32,
                         ty: ArbitrationType, value: i32,
                         timeout_ns: u64) -> Result<(), KError>;

    fn create_event(&mut self, reset: ResetType) -> Result<Handle, KError>;

    fn signal_event(&mut self, event: Handle) -> Result<(), KError>;

    /// Create a named port. Returns (server, client) handles.
    fn create_port(&mut self, name: &str, max_sessions: u32)
                   -> Result<(Handle, Handle), KError>;

    fn accept_session(&mut self, server: Handle) -> Result<Handle, KError>;

    /// Reply to `reply_target` (0 for none) and block until one of
    /// `handles` is signaled. Returns the index of the woken handle.
    fn reply_and_receive(&mut self, handles: &[Handle],
                         reply_target: Handle) -> Result<usize, KError>;

    fn close_handle(&mut self, handle: Handle);

    /// The 64-word IPC command buffer of the service thread
    fn cmd_buf(&mut self) -> &mut [u32; 64];

    /// Copy bytes out of an IPC-translated buffer of the client
    fn copy_from_user(&mut self, va: u32, dst: &mut [u8])
                      -> Result<(), KError>;

    /// Copy bytes into an IPC-translated buffer of the client
    fn copy_to_user(&mut self, va: u32, src: &[u8]) -> Result<(), KError>;

    fn sleep_thread(&mut self, ns: u64);

    /// `svcKernelSetState` — registers the plugin notification event
    fn set_kernel_state(&mut self, ty: u32, handle: Handle);

    /// Process-wide termination flag polled by the service loop
    fn termination_requested(&self) -> bool;

    /// Execute the in-place decrypt stub over `buf`. The stub bytes
    /// live in loader memory with execute permission; running them is
    /// the kernel backend's business since the core never jumps into
    /// data on the host.
    fn run_decrypt_stub(&mut self, stub: &::container::DecryptStub,
                        buf: &mut [u8]);

    /// Physical address of the entry trampoline stub
    /// (assembly, provided by the enclosing framework) that the game's
    /// patched first instruction branches to
    fn entry_trampoline_pa(&mut self) -> u32;
}

#[test]
fn result_packing() {
    // "no plugin found" result reported by the locator
    assert!(make_result(RL_USAGE, RS_NOTFOUND, 0, 1018) == 0xe08003fa);
}
