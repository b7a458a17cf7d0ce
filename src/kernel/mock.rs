//! Scripted kernel used by the test suite.
//!
//! Every syscall the loader issues is recorded so tests can assert on
//! the exact sequence of mappings, arbitrations and configuration
//! writes. The `reply_and_receive` primitive pops wake-ups from a
//! script the test pre-loads; when the script runs dry the mock raises
//! the termination flag and fails the receive with a session-closed
//! code, which walks the service loop out through its regular
//! shutdown path.

use std::collections::{HashMap, VecDeque};

use container::DecryptStub;

use super::{ArbitrationType, Handle, KError, Kernel, ResetType};
use super::{map, ERR_SESSION_CLOSED};

/// Result code the mock hands out for rejected operations
pub const MOCK_FAIL: u32 = 0xc860180a;

/// An active cross-process mapping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub process: Handle,
    pub dst_va: u32,
    pub src_process: Handle,
    pub src_va: u32,
    pub size: u32,
}

pub struct MockProcess {
    pub title_id: u64,
    /// First page of the process code region (the page the entry hook
    /// is patched into)
    pub code_page: Vec<u8>,
    pub mmu_rwx: bool,
    pub exit_signal: bool,
}

/// One scripted return from `reply_and_receive`
pub enum Wake {
    /// Kernel notification; the payload is stored in the high half of
    /// the plugin status cell before waking index 0
    KernelEvent(u32),
    /// New connection on the service port
    Port,
    /// Client request: the words are copied into the command buffer
    Session(Vec<u32>),
    /// The injected process is terminating
    TargetExit,
    /// Fail the receive with a session-closed error
    SessionClosed,
}

pub struct MockKernel {
    pub sysinfo: HashMap<(u32, u32), i64>,
    pub pa_cells: HashMap<u32, u32>,
    /// Log of (pa, value) writes, LED register included
    pub pa_writes: Vec<(u32, u32)>,
    /// Live allocations: va -> (size, op)
    pub allocations: HashMap<u32, (u32, u32)>,
    /// Allocation at this va fails once
    pub fail_alloc_at: Option<u32>,
    /// Mapping at this destination va fails
    pub fail_map_at: Option<u32>,
    pub mappings: Vec<Mapping>,
    pub processes: HashMap<Handle, MockProcess>,
    /// (process, locked, tls_magic) log of thread scheduling calls
    pub scheduled: Vec<(Handle, bool, u32)>,
    pub cmdbuf: [u32; 64],
    /// Client buffers reachable through IPC translation: va -> bytes
    pub user_mem: HashMap<u32, Vec<u8>>,
    pub script: VecDeque<Wake>,
    /// (arbiter, addr, type, value, timeout) log
    pub arbitrations: Vec<(Handle, u32, ArbitrationType, i32, u64)>,
    pub signaled_events: Vec<Handle>,
    pub closed_handles: Vec<Handle>,
    pub ports: Vec<(String, u32)>,
    pub kernel_state: Vec<(u32, Handle)>,
    pub icache_invalidations: u32,
    pub dcache_flushes: u32,
    pub slept_ns: u64,
    pub sleep_count: u32,
    pub terminate: bool,
    pub trampoline_pa: u32,
    next_handle: Handle,
}

impl MockKernel {
    pub fn new() -> MockKernel {
        MockKernel {
            sysinfo: HashMap::new(),
            pa_cells: HashMap::new(),
            pa_writes: Vec::new(),
            allocations: HashMap::new(),
            fail_alloc_at: None,
            fail_map_at: None,
            mappings: Vec::new(),
            processes: HashMap::new(),
            scheduled: Vec::new(),
            cmdbuf: [0; 64],
            user_mem: HashMap::new(),
            script: VecDeque::new(),
            arbitrations: Vec::new(),
            signaled_events: Vec::new(),
            closed_handles: Vec::new(),
            ports: Vec::new(),
            kernel_state: Vec::new(),
            icache_invalidations: 0,
            dcache_flushes: 0,
            slept_ns: 0,
            sleep_count: 0,
            terminate: false,
            trampoline_pa: 0x00de_ad00,
            next_handle: 0x100,
        }
    }

    /// Register a fake process and return its handle. The code page
    /// starts with two recognizable instruction words so tests can
    /// check the entry hook saves and replaces them.
    pub fn add_process(&mut self, title_id: u64) -> Handle {
        let handle = self.fresh_handle();

        let mut code_page = vec![0u8; 0x1000];

        put_word(&mut code_page, 0, 0xea00002e);
        put_word(&mut code_page, 4, 0xe59ff018);

        self.processes.insert(handle, MockProcess {
            title_id: title_id,
            code_page: code_page,
            mmu_rwx: false,
            exit_signal: false,
        });

        handle
    }

    /// Expose a client buffer to IPC translation
    pub fn add_user_buffer(&mut self, va: u32, data: Vec<u8>) {
        self.user_mem.insert(va, data);
    }

    pub fn code_word(&self, process: Handle, offset: usize) -> u32 {
        let page = &self.processes[&process].code_page;

        get_word(page, offset)
    }

    /// Active mappings into `process`
    pub fn mappings_into(&self, process: Handle) -> Vec<&Mapping> {
        self.mappings.iter()
            .filter(|m| m.process == process)
            .collect()
    }

    fn fresh_handle(&mut self) -> Handle {
        let h = self.next_handle;

        self.next_handle += 4;

        h
    }

    /// Resolve a loader virtual address through the active mappings
    /// into our own address space
    fn resolve(&mut self, va: u32) -> (Handle, u32) {
        for m in &self.mappings {
            if m.process == super::CUR_PROCESS_HANDLE
                && va >= m.dst_va && va < m.dst_va + m.size {
                return (m.src_process, m.src_va + (va - m.dst_va));
            }
        }

        panic!("access to unmapped loader address 0x{:08x}", va);
    }
}

impl Kernel for MockKernel {
    fn get_system_info(&mut self, ty: u32, param: u32) -> i64 {
        *self.sysinfo.get(&(ty, param)).unwrap_or(&0)
    }

    fn read_pa(&mut self, pa: u32) -> u32 {
        *self.pa_cells.get(&pa).unwrap_or(&0)
    }

    fn write_pa(&mut self, pa: u32, val: u32) {
        self.pa_writes.push((pa, val));
        self.pa_cells.insert(pa, val);
    }

    fn pa_from_va(&mut self, va: usize) -> u32 {
        va as u32
    }

    fn control_memory(&mut self, va: u32, size: u32, op: u32, _perm: u32)
                      -> Result<u32, KError> {
        if op & 0xff == super::MEMOP_ALLOC {
            if self.fail_alloc_at == Some(va) {
                self.fail_alloc_at = None;
                return Err(KError(MOCK_FAIL));
            }

            self.allocations.insert(va, (size, op));

            Ok(va)
        } else {
            self.allocations.remove(&va);

            Ok(va)
        }
    }

    fn map_process_memory(&mut self, process: Handle, dst_va: u32,
                          src_process: Handle, src_va: u32, size: u32)
                          -> Result<(), KError> {
        if self.fail_map_at == Some(dst_va) {
            return Err(KError(MOCK_FAIL));
        }

        self.mappings.push(Mapping {
            process: process,
            dst_va: dst_va,
            src_process: src_process,
            src_va: src_va,
            size: size,
        });

        Ok(())
    }

    fn unmap_process_memory(&mut self, process: Handle, va: u32,
                            size: u32) -> Result<(), KError> {
        let pos = self.mappings.iter().position(|m| {
            m.process == process && m.dst_va == va && m.size == size
        });

        match pos {
            Some(p) => {
                self.mappings.remove(p);
                Ok(())
            }
            None => Err(KError(MOCK_FAIL)),
        }
    }

    fn read_word(&mut self, va: u32) -> u32 {
        let (process, remote_va) = self.resolve(va);
        let offset = (remote_va - map::GAME_ENTRY_VA) as usize;

        get_word(&self.processes[&process].code_page, offset)
    }

    fn write_word(&mut self, va: u32, val: u32) {
        let (process, remote_va) = self.resolve(va);
        let offset = (remote_va - map::GAME_ENTRY_VA) as usize;

        let page = &mut self.processes.get_mut(&process)
            .unwrap().code_page;

        put_word(page, offset, val);
    }

    fn flush_data_cache_range(&mut self, _va: usize, _len: usize) {
        self.dcache_flushes += 1;
    }

    fn flush_entire_data_cache(&mut self) {
        self.dcache_flushes += 1;
    }

    fn invalidate_instruction_cache(&mut self) {
        self.icache_invalidations += 1;
    }

    fn get_process_title_id(&mut self, process: Handle)
                            -> Result<u64, KError> {
        self.processes.get(&process)
            .map(|p| p.title_id)
            .ok_or(KError(MOCK_FAIL))
    }

    fn set_process_mmu_rwx(&mut self, process: Handle)
                           -> Result<(), KError> {
        match self.processes.get_mut(&process) {
            Some(p) => {
                p.mmu_rwx = true;
                Ok(())
            }
            None => Err(KError(MOCK_FAIL)),
        }
    }

    fn signal_on_exit(&mut self, process: Handle) -> Result<(), KError> {
        match self.processes.get_mut(&process) {
            Some(p) => {
                p.exit_signal = true;
                Ok(())
            }
            None => Err(KError(MOCK_FAIL)),
        }
    }

    fn schedule_threads(&mut self, process: Handle, lock: bool,
                        tls_magic: u32) -> Result<(), KError> {
        self.scheduled.push((process, lock, tls_magic));

        Ok(())
    }

    fn create_address_arbiter(&mut self) -> Result<Handle, KError> {
        Ok(self.fresh_handle())
    }

    fn arbitrate_address(&mut self, arbiter: Handle, addr: u32,
                         ty: ArbitrationType, value: i32,
                         timeout_ns: u64) -> Result<(), KError> {
        self.arbitrations.push((arbiter, addr, ty, value, timeout_ns));

        Ok(())
    }

    fn create_event(&mut self, _reset: ResetType)
                    -> Result<Handle, KError> {
        Ok(self.fresh_handle())
    }

    fn signal_event(&mut self, event: Handle) -> Result<(), KError> {
        self.signaled_events.push(event);

        Ok(())
    }

    fn create_port(&mut self, name: &str, max_sessions: u32)
                   -> Result<(Handle, Handle), KError> {
        self.ports.push((name.to_owned(), max_sessions));

        Ok((self.fresh_handle(), self.fresh_handle()))
    }

    fn accept_session(&mut self, _server: Handle)
                      -> Result<Handle, KError> {
        Ok(self.fresh_handle())
    }

    fn reply_and_receive(&mut self, handles: &[Handle],
                         reply_target: Handle) -> Result<usize, KError> {
        let _ = reply_target;

        match self.script.pop_front() {
            Some(Wake::KernelEvent(event)) => {
                let status = self.read_pa(map::PLG_STATUS_PA) & 0xffff;

                self.write_pa(map::PLG_STATUS_PA, status | event);

                Ok(0)
            }
            Some(Wake::Port) => Ok(1),
            Some(Wake::Session(words)) => {
                for (i, &w) in words.iter().enumerate() {
                    self.cmdbuf[i] = w;
                }

                Ok(2)
            }
            Some(Wake::TargetExit) => Ok(handles.len() - 1),
            Some(Wake::SessionClosed) => Err(KError(ERR_SESSION_CLOSED)),
            None => {
                // Script exhausted: shut the loop down
                self.terminate = true;

                Err(KError(ERR_SESSION_CLOSED))
            }
        }
    }

    fn close_handle(&mut self, handle: Handle) {
        self.closed_handles.push(handle);
    }

    fn cmd_buf(&mut self) -> &mut [u32; 64] {
        &mut self.cmdbuf
    }

    fn copy_from_user(&mut self, va: u32, dst: &mut [u8])
                      -> Result<(), KError> {
        for (&addr, buf) in &self.user_mem {
            if va >= addr && (va - addr) as usize + dst.len() <= buf.len() {
                let off = (va - addr) as usize;

                dst.copy_from_slice(&buf[off..off + dst.len()]);

                return Ok(());
            }
        }

        Err(KError(MOCK_FAIL))
    }

    fn copy_to_user(&mut self, va: u32, src: &[u8]) -> Result<(), KError> {
        for (&addr, buf) in &mut self.user_mem {
            if va >= addr && (va - addr) as usize + src.len() <= buf.len() {
                let off = (va - addr) as usize;

                buf[off..off + src.len()].copy_from_slice(src);

                return Ok(());
            }
        }

        Err(KError(MOCK_FAIL))
    }

    fn sleep_thread(&mut self, ns: u64) {
        self.slept_ns += ns;
        self.sleep_count += 1;
    }

    fn set_kernel_state(&mut self, ty: u32, handle: Handle) {
        self.kernel_state.push((ty, handle));
    }

    fn termination_requested(&self) -> bool {
        self.terminate
    }

    fn run_decrypt_stub(&mut self, stub: &DecryptStub, buf: &mut [u8]) {
        // The mock's stand-in for "branch into the stub": an installed
        // routine xors the buffer with its first parameter byte, the
        // identity stub leaves it alone.
        if !stub.is_identity() {
            let key = stub.params()[0] as u8;

            for b in buf.iter_mut() {
                *b ^= key;
            }
        }
    }

    fn entry_trampoline_pa(&mut self) -> u32 {
        self.trampoline_pa
    }
}

fn put_word(page: &mut [u8], offset: usize, val: u32) {
    for i in 0..4 {
        page[offset + i] = (val >> (i * 8)) as u8;
    }
}

fn get_word(page: &[u8], offset: usize) -> u32 {
    page[offset] as u32
        | (page[offset + 1] as u32) << 8
        | (page[offset + 2] as u32) << 16
        | (page[offset + 3] as u32) << 24
}
