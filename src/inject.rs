//! The injection pipeline.
//!
//! Runs when the kernel reports a freshly created game process: pick
//! the container file, stage it through the tail of the arena, build
//! the plugin header, mount the arena into the target and patch the
//! game entry point so the plugin bootstraps before the game's first
//! own instruction.

use std::io::{Read, Seek};

use arena::{MemoryArena, PluginHeader};
use arena::{ARENA_SIZE, PLUGIN_HEADER_SIZE};
use container;
use container::DecryptStub;
use error::{Error, ErrorKind};
use kernel::{map, Handle, KError, Kernel, CUR_PROCESS_HANDLE};
use locator;
use rendezvous::{Rendezvous, EVENT_OK};
use sdmc::Sdmc;

/// `ldr pc, [pc, #-4]`: jump through the literal word that follows
/// the instruction
pub const ENTRY_HOOK_INSTR: u32 = 0xe51f_f004;

/// One-shot load parameters supplied over IPC, consumed by the next
/// load of a matching title
pub struct LoadOverride {
    /// Low word of the title id this override applies to
    pub title_id: u32,
    pub path: String,
    pub config: [u32; 32],
    pub no_flash: bool,
}

/// What a successful injection leaves behind
#[derive(Debug)]
pub struct LoadOutcome {
    pub header: PluginHeader,
    pub path: String,
    /// The two entry instructions the hook displaced; the trampoline
    /// replays them when handing control back to the game
    pub saved_game_instr: [u32; 2],
}

/// Try to inject a plugin into `process`.
///
/// `Ok(None)` means there was simply no plugin to load, which is not
/// an error. Any real failure releases the arena before returning;
/// closing the target handle is the caller's business.
pub fn try_to_load_plugin<K: Kernel>(kernel: &mut K,
                                     sdmc: &Sdmc,
                                     arena: &mut MemoryArena,
                                     rendezvous: &Rendezvous,
                                     arbiter: Handle,
                                     stub: &mut DecryptStub,
                                     override_slot: &mut Option<LoadOverride>,
                                     process: Handle)
                                     -> Result<Option<LoadOutcome>, Error> {
    let res = load(kernel, sdmc, arena, rendezvous, arbiter, stub,
                   override_slot, process);

    if res.is_err() {
        let _ = arena.release(kernel);
    }

    res
}

fn load<K: Kernel>(kernel: &mut K,
                   sdmc: &Sdmc,
                   arena: &mut MemoryArena,
                   rendezvous: &Rendezvous,
                   arbiter: Handle,
                   stub: &mut DecryptStub,
                   override_slot: &mut Option<LoadOverride>,
                   process: Handle)
                   -> Result<Option<LoadOutcome>, Error> {
    let tid = kernel.get_process_title_id(process)?;

    let mut header = PluginHeader::new();

    // A matching override is consumed by this load attempt no matter
    // how the attempt ends
    let matching_override =
        match *override_slot {
            Some(ref o) if o.title_id == tid as u32 => true,
            _ => false,
        };

    let (mut file, path) =
        if matching_override {
            let o = override_slot.take().unwrap();

            match sdmc.open(&o.path) {
                Ok(f) => {
                    header.config = o.config;

                    (f, o.path)
                }
                // The requested file is gone; nothing to load
                Err(_) => return Ok(None),
            }
        } else {
            match locator::open_plugin_file(sdmc, tid) {
                Ok(located) => {
                    if located.is_default {
                        header.is_default_plugin = 1;
                    }

                    (located.file, located.path)
                }
                Err(ref e) if e.kind() == ErrorKind::NotFound =>
                    return Ok(None),
                Err(e) => return Err(e),
            }
        };

    // A resident arena means another plugin is still injected
    // somewhere: concurrent loads are forbidden
    if arena.is_ready() {
        return Err(Error::with_message(ErrorKind::Unknown, 0,
                                       "A plugin is already loaded"));
    }

    arena.acquire(kernel)?;

    let file_size = file.metadata()
        .map_err(|_| Error::with_message(ErrorKind::IoFailure, 0,
                                         "Couldn't get file size"))?
        .len();

    if file_size == 0
        || file_size as usize >= ARENA_SIZE - PLUGIN_HEADER_SIZE {
        return Err(Error::with_message(
            ErrorKind::Malformed, 0,
            "The plugin file doesn't fit the arena"));
    }

    container::check_magic(&mut file).map_err(|e| {
        Error::with_message(e.kind(), e.code(),
                            "File signature mismatch!\n\
                             Check your plugin file and for an update.")
    })?;

    // Stage the container at the tail of the arena so the header and
    // the load segments never run into it
    let staging_at = ARENA_SIZE - file_size as usize;

    let container_header = {
        let block = arena.block_mut();
        let (front, staging) = block.split_at_mut(staging_at);

        let h = read_staged_header(&mut file, staging)?;

        if !h.is_compatible(staging, tid as u32) {
            let title =
                String::from_utf8_lossy(h.title(staging)).into_owned();
            let author =
                String::from_utf8_lossy(h.author(staging)).into_owned();

            return Err(Error::with_message(
                ErrorKind::Incompatible, 0,
                format!("The plugin - {} -\n\
                         is not compatible with this game.\n\
                         Contact \"{}\" for more infos.",
                        title, author)));
        }

        let code_region = &mut front[PLUGIN_HEADER_SIZE..];

        container::read_load_segments(&mut file, &h, code_region,
                                      stub, kernel)
            .map_err(|e| annotate_io(e, "Couldn't read plugin's code"))?;

        h
    };

    header.version = container_header.version;

    header.exe_size =
        match exe_footprint(&container_header.executable) {
            Some(size) => size,
            None => return Err(Error::with_message(
                ErrorKind::Malformed, 0,
                "The plugin is too large for the arena")),
        };

    header.heap_va = map::HEAP_VA;
    header.heap_size = ARENA_SIZE as u32 - header.exe_size;
    header.event_pa = rendezvous.event_pa(kernel);
    header.reply_pa = rendezvous.reply_pa(kernel);

    // Clear stale event data from a previous plugin
    rendezvous.notify(kernel, arbiter, EVENT_OK, false);

    {
        let block = arena.block_mut();

        header.write_to(block);

        // Fresh heap for the plugin; this also wipes the staging area
        for b in block[header.exe_size as usize..].iter_mut() {
            *b = 0;
        }
    }

    // The plugin expects to write anywhere in the target, and we want
    // to know when the target goes away
    let _ = kernel.set_process_mmu_rwx(process);
    let _ = kernel.signal_on_exit(process);

    if let Err(e) = arena.mount_in(kernel, process, &header) {
        // A failed mount can leave the exe window behind
        let _ = arena.unmount_from(kernel, process, &header);

        return Err(e);
    }

    let saved = match install_entry_hook(kernel, process) {
        Ok(saved) => saved,
        Err(KError(code)) => {
            let _ = arena.unmount_from(kernel, process, &header);

            return Err(Error::with_message(ErrorKind::MapFailure, code,
                                           "Couldn't map process"));
        }
    };

    info!("injected {} into title {:016x} (exe 0x{:x}, heap 0x{:x})",
          path, tid, header.exe_size, header.heap_size);

    Ok(Some(LoadOutcome {
        header: header,
        path: path,
        saved_game_instr: saved,
    }))
}

/// Executable footprint inside the arena: header plus all segments,
/// rounded up to the next page boundary with an extra guard page.
/// `None` if that leaves no room for a heap.
pub fn exe_footprint(exe: &container::Executable) -> Option<u32> {
    let total = PLUGIN_HEADER_SIZE as u64
        + exe.code_size as u64
        + exe.rodata_size as u64
        + exe.data_size as u64
        + exe.bss_size as u64
        + 0x1000;

    let rounded = total & !0xfff;

    if rounded >= ARENA_SIZE as u64 {
        None
    } else {
        Some(rounded as u32)
    }
}

/// Patch the first two instructions of the game: a pc-relative load
/// jumping through the physical address of the entry trampoline. The
/// page is briefly mapped into our own address space to do the write.
fn install_entry_hook<K: Kernel>(kernel: &mut K, process: Handle)
                                 -> Result<[u32; 2], KError> {
    let entry = map::GAME_ENTRY_VA;

    kernel.map_process_memory(CUR_PROCESS_HANDLE, entry, process,
                              entry, 0x1000)?;

    let saved = [kernel.read_word(entry),
                 kernel.read_word(entry + 4)];

    kernel.write_word(entry, ENTRY_HOOK_INSTR);

    let trampoline = kernel.entry_trampoline_pa();
    kernel.write_word(entry + 4, trampoline);

    kernel.flush_entire_data_cache();

    let _ = kernel.unmap_process_memory(CUR_PROCESS_HANDLE, entry,
                                        0x1000);

    Ok(saved)
}

fn read_staged_header<R: Read + Seek>(r: &mut R, staging: &mut [u8])
                                      -> Result<container::Header, Error> {
    container::read_header(r, staging)
        .map_err(|e| annotate_io(e, "Couldn't read file"))
}

/// Give I/O failures the human message the error prompt shows;
/// container-level failures already carry their own
fn annotate_io(e: Error, message: &str) -> Error {
    if e.kind() == ErrorKind::IoFailure {
        Error::with_message(ErrorKind::IoFailure, e.code(), message)
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use tempdir::TempDir;

    use arena::{MemoryArena, PluginHeader};
    use arena::{ARENA_SIZE, PLUGIN_HEADER_SIZE};
    use container::tests::build;
    use container::DecryptStub;
    use error::ErrorKind;
    use kernel::mock::MockKernel;
    use kernel::{map, Handle, CUR_PROCESS_HANDLE};
    use rendezvous::Rendezvous;
    use sdmc::Sdmc;
    use super::*;

    struct Rig {
        _dir: TempDir,
        sdmc: Sdmc,
        kernel: MockKernel,
        arena: MemoryArena,
        rendezvous: Rendezvous,
        stub: DecryptStub,
        override_slot: Option<LoadOverride>,
    }

    impl Rig {
        fn new() -> Rig {
            let dir = TempDir::new("plgldr-inject").unwrap();
            let sdmc = Sdmc::new(dir.path());

            fs::create_dir_all(sdmc.resolve("/luma/plugins")).unwrap();

            Rig {
                _dir: dir,
                sdmc: sdmc,
                kernel: MockKernel::new(),
                arena: MemoryArena::new(false),
                rendezvous: Rendezvous::new(),
                stub: DecryptStub::new(),
                override_slot: None,
            }
        }

        fn write_plugin(&self, path: &str, img: &[u8]) {
            let full = self.sdmc.resolve(path);

            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::File::create(full).unwrap().write_all(img).unwrap();
        }

        fn load(&mut self, process: Handle)
                -> Result<Option<LoadOutcome>, ::error::Error> {
            try_to_load_plugin(&mut self.kernel, &self.sdmc,
                               &mut self.arena, &self.rendezvous,
                               0x42, &mut self.stub,
                               &mut self.override_slot, process)
        }
    }

    #[test]
    fn full_injection() {
        let mut rig = Rig::new();

        let code = b"plugin code bytes".to_vec();
        let img = build(b"0001", b"someone", b"cheat pack", &[],
                        &code);

        rig.write_plugin("/luma/plugins/0000000000001234/x.3gx", &img);

        let process = rig.kernel.add_process(0x1234);
        let original = [rig.kernel.code_word(process, 0),
                        rig.kernel.code_word(process, 4)];

        let outcome = rig.load(process).unwrap().unwrap();

        // Sizing invariants
        assert!(outcome.header.exe_size % 0x1000 == 0);
        assert!(outcome.header.exe_size + outcome.header.heap_size
                == ARENA_SIZE as u32);
        assert!(outcome.header.heap_va == map::HEAP_VA);

        // The header landed at the start of the arena
        let written = PluginHeader::read_from(rig.arena.block());
        assert!(written.exe_size == outcome.header.exe_size);
        assert!(written.is_default_plugin == 0);

        // Code right after the header, heap zeroed behind it
        let block = rig.arena.block();
        assert!(&block[PLUGIN_HEADER_SIZE..PLUGIN_HEADER_SIZE
                       + code.len()] == &code[..]);
        assert!(block[outcome.header.exe_size as usize..].iter()
                .all(|&b| b == 0));

        // Both windows mounted in the target
        assert!(rig.kernel.mappings_into(process).len() == 2);

        // The process was prepared
        assert!(rig.kernel.processes[&process].mmu_rwx);
        assert!(rig.kernel.processes[&process].exit_signal);

        // Entry hook: jump through the trampoline address, original
        // instructions saved
        assert!(rig.kernel.code_word(process, 0) == ENTRY_HOOK_INSTR);
        assert!(rig.kernel.code_word(process, 4)
                == rig.kernel.trampoline_pa);
        assert!(outcome.saved_game_instr == original);

        // The hook page didn't stay mapped in the loader
        assert!(rig.kernel
                .mappings_into(CUR_PROCESS_HANDLE).is_empty());

        assert!(rig.kernel.dcache_flushes > 0);
        assert!(outcome.path.ends_with("x.3gx"));
    }

    #[test]
    fn incompatible_plugin_names_the_culprit() {
        let mut rig = Rig::new();

        let img = build(b"0001", b"someone", b"cheat pack",
                        &[0xaaaa, 0xbbbb], b"code");

        rig.write_plugin("/luma/plugins/000000000000CCCC/x.3gx", &img);

        let process = rig.kernel.add_process(0xcccc);

        let err = rig.load(process).unwrap_err();

        assert!(err.kind() == ErrorKind::Incompatible);

        let message = err.message().unwrap();
        assert!(message.contains("cheat pack"));
        assert!(message.contains("someone"));

        // Failure released the arena
        assert!(!rig.arena.is_ready());
        assert!(rig.kernel.allocations.is_empty());
    }

    #[test]
    fn outdated_plugin_is_rejected() {
        let mut rig = Rig::new();

        let img = build(b"0000", b"a", b"b", &[], b"code");

        rig.write_plugin("/luma/plugins/0000000000001234/x.3gx", &img);

        let process = rig.kernel.add_process(0x1234);

        let err = rig.load(process).unwrap_err();

        assert!(err.kind() == ErrorKind::PluginOutdated);
        assert!(!rig.arena.is_ready());
    }

    #[test]
    fn no_plugin_is_not_an_error() {
        let mut rig = Rig::new();

        let process = rig.kernel.add_process(0x1234);

        assert!(rig.load(process).unwrap().is_none());
        assert!(!rig.arena.is_ready());
    }

    #[test]
    fn override_is_consumed_on_match() {
        let mut rig = Rig::new();

        let img = build(b"0001", b"a", b"b", &[], b"code");
        rig.write_plugin("/x.3gx", &img);

        // A directory plugin exists too but the override wins
        rig.write_plugin("/luma/plugins/0000000000001234/dir.3gx",
                         &img);

        let mut config = [0u32; 32];
        config[0] = 0xcafe;

        rig.override_slot = Some(LoadOverride {
            title_id: 0x1234,
            path: "/x.3gx".to_owned(),
            config: config,
            no_flash: true,
        });

        let process = rig.kernel.add_process(0x1234);
        let outcome = rig.load(process).unwrap().unwrap();

        assert!(outcome.path == "/x.3gx");
        assert!(outcome.header.config[0] == 0xcafe);
        assert!(rig.override_slot.is_none());
    }

    #[test]
    fn override_ignored_for_other_titles() {
        let mut rig = Rig::new();

        let img = build(b"0001", b"a", b"b", &[], b"code");
        rig.write_plugin("/luma/plugins/0000000000005678/dir.3gx",
                         &img);

        rig.override_slot = Some(LoadOverride {
            title_id: 0x1234,
            path: "/x.3gx".to_owned(),
            config: [0; 32],
            no_flash: false,
        });

        let process = rig.kernel.add_process(0x5678);
        let outcome = rig.load(process).unwrap().unwrap();

        assert!(outcome.path.ends_with("dir.3gx"));
        assert!(rig.override_slot.is_some());
    }

    #[test]
    fn override_with_missing_file_fails_quietly() {
        let mut rig = Rig::new();

        rig.override_slot = Some(LoadOverride {
            title_id: 0x1234,
            path: "/gone.3gx".to_owned(),
            config: [0; 32],
            no_flash: false,
        });

        let process = rig.kernel.add_process(0x1234);

        assert!(rig.load(process).unwrap().is_none());
        // Consumed all the same
        assert!(rig.override_slot.is_none());
    }

    #[test]
    fn concurrent_load_is_forbidden() {
        let mut rig = Rig::new();

        let img = build(b"0001", b"a", b"b", &[], b"code");
        rig.write_plugin("/luma/plugins/0000000000001234/x.3gx", &img);

        rig.arena.acquire(&mut rig.kernel).unwrap();

        let process = rig.kernel.add_process(0x1234);

        assert!(rig.load(process).is_err());
    }

    #[test]
    fn heap_map_failure_rolls_back() {
        let mut rig = Rig::new();

        let img = build(b"0001", b"a", b"b", &[], b"code");
        rig.write_plugin("/luma/plugins/0000000000001234/x.3gx", &img);

        rig.kernel.fail_map_at = Some(map::HEAP_VA);

        let process = rig.kernel.add_process(0x1234);

        let err = rig.load(process).unwrap_err();

        assert!(err.kind() == ErrorKind::MapFailure);
        // Exe window unmapped again, arena gone
        assert!(rig.kernel.mappings_into(process).is_empty());
        assert!(!rig.arena.is_ready());
    }

    #[test]
    fn default_plugin_sets_the_flag() {
        let mut rig = Rig::new();

        let img = build(b"0001", b"a", b"b", &[], b"code");
        rig.write_plugin(::locator::DEFAULT_PLUGIN_PATH, &img);

        let process = rig.kernel.add_process(0x1234);
        let outcome = rig.load(process).unwrap().unwrap();

        assert!(outcome.header.is_default_plugin == 1);
        assert!(outcome.path == ::locator::DEFAULT_PLUGIN_PATH);
    }
}
