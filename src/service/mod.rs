//! The `plg:ldr` service loop.
//!
//! A single thread owns every piece of mutable loader state and
//! multiplexes four wake-up sources through `reply-and-receive`: the
//! kernel notification event (swap and exit), the service port, the
//! client session and the injected process handle. Nothing here needs
//! a lock; the only blocking points are the receive itself and the
//! bounded rendezvous waits.

pub mod commands;


use arrayvec::ArrayVec;

use arena::{MemoryArena, PluginHeader};
use container::DecryptStub;
use error::Error;
use frontend::{Frontend, Settings};
use inject::LoadOverride;
use kernel::{map, sysinfo, Handle, KError, Kernel, ResetType};
use kernel::{ERR_SESSION_CLOSED, STATE_REGISTER_PLG_EVENT};
use rendezvous::Rendezvous;
use rendezvous::{EVENT_ABOUT_TO_EXIT, EVENT_ABOUT_TO_SWAP, EVENT_OK};
use sdmc::Sdmc;

pub const SERVICE_NAME: &'static str = "plg:ldr";

/// Title used for loader error prompts
pub const TITLE: &'static str = "Plugin loader";

/// Magic word at the start of the thread local storage of every
/// thread the plugin spawns (`!TV$`). This is how swap suspension
/// tells plugin threads from game threads.
pub const TLS_MAGIC: u32 = 0x2154_5624;

/// Plugin status, low half of the status cell
pub const STATUS_NONE: u32 = 0;
pub const STATUS_RUNNING: u32 = 1;
pub const STATUS_SWAPPED: u32 = 2;

/// Inbound events, high half of the status cell
pub const EVENT_SWAP: u32 = 1 << 16;
pub const EVENT_EXIT: u32 = 2 << 16;

pub struct Loader<K: Kernel> {
    kernel: K,
    sdmc: Sdmc,
    frontend: Box<Frontend>,
    settings: Settings,
    arena: MemoryArena,
    header: PluginHeader,
    rendezvous: Rendezvous,
    stub: DecryptStub,
    /// Path of the currently injected plugin
    path_current: String,
    load_override: Option<LoadOverride>,
    /// Skip the next load notification flash
    no_flash: bool,
    /// Entry instructions displaced by the hook, replayed by the
    /// trampoline
    saved_game_instr: [u32; 2],
    /// Injected game process, 0 when idle
    process: Handle,
    arbiter: Handle,
    pending_error: Option<Error>,
    plugin_is_swapped: bool,
}

impl<K: Kernel> Loader<K> {
    pub fn new(mut kernel: K, sdmc: Sdmc, frontend: Box<Frontend>,
               is_n3ds: bool) -> Loader<K> {
        let (ty, param) = sysinfo::LOADER_CONFIG;
        let enabled = kernel.get_system_info(ty, param) & 1 != 0;

        Loader {
            kernel: kernel,
            sdmc: sdmc,
            frontend: frontend,
            settings: Settings { enabled: enabled },
            arena: MemoryArena::new(is_n3ds),
            header: PluginHeader::new(),
            rendezvous: Rendezvous::new(),
            stub: DecryptStub::new(),
            path_current: String::new(),
            load_override: None,
            no_flash: false,
            saved_game_instr: [0; 2],
            process: 0,
            arbiter: 0,
            pending_error: None,
            plugin_is_swapped: false,
        }
    }

    /// Run the service until the process-wide termination flag rises.
    ///
    /// Setup failures are fatal: a loader that can't create its port
    /// or its arbiter has nothing to offer.
    pub fn run(&mut self) {
        self.arbiter = match self.kernel.create_address_arbiter() {
            Ok(h) => h,
            Err(KError(code)) =>
                panic!("couldn't create the arbiter: 0x{:08x}", code),
        };

        let kernel_event =
            match self.kernel.create_event(ResetType::OneShot) {
                Ok(h) => h,
                Err(KError(code)) =>
                    panic!("couldn't create the kernel event: 0x{:08x}",
                           code),
            };

        let (server, client) =
            match self.kernel.create_port(SERVICE_NAME, 1) {
                Ok(h) => h,
                Err(KError(code)) =>
                    panic!("couldn't create the service port: 0x{:08x}",
                           code),
            };

        self.kernel.set_kernel_state(STATE_REGISTER_PLG_EVENT,
                                     kernel_event);

        info!("plugin loader up, waiting for work");

        let mut session: Handle = 0;
        let mut reply_target: Handle = 0;

        loop {
            let mut handles = ArrayVec::<[Handle; 4]>::new();

            handles.push(kernel_event);
            handles.push(server);

            if session != 0 {
                handles.push(session);
            } else if self.process != 0 {
                handles.push(self.process);
            }

            if session != 0 && self.process != 0 {
                handles.push(self.process);
            }

            if reply_target == 0 {
                // Nothing to reply to
                self.kernel.cmd_buf()[0] = 0xffff0000;
            }

            match self.kernel.reply_and_receive(&handles, reply_target) {
                Err(KError(code)) => {
                    if code == ERR_SESSION_CLOSED {
                        self.kernel.close_handle(session);
                        session = 0;
                        reply_target = 0;
                    } else {
                        panic!("reply_and_receive failed: 0x{:08x}",
                               code);
                    }
                }
                Ok(0) => {
                    self.handle_kernel_event();

                    // Acknowledge so the kernel can move on
                    let _ = self.kernel.signal_event(kernel_event);
                    reply_target = 0;
                }
                Ok(1) => {
                    let new_session =
                        match self.kernel.accept_session(server) {
                            Ok(s) => s,
                            Err(KError(code)) =>
                                panic!("couldn't accept a session: \
                                        0x{:08x}", code),
                        };

                    if session == 0 {
                        session = new_session;
                    } else {
                        // Single-session service
                        self.kernel.close_handle(new_session);
                    }

                    reply_target = 0;
                }
                Ok(2) if handles.get(2) == Some(&session) => {
                    commands::handle_commands(self);

                    // Reply on the next receive
                    reply_target = session;
                }
                Ok(_) => {
                    // The process we injected the plugin into is
                    // terminating
                    self.teardown_target();
                    reply_target = 0;
                }
            }

            if let Some(error) = self.pending_error.take() {
                let message = error.message().map(|m| m.to_owned());

                if let Some(message) = message {
                    self.frontend.display_error(TITLE, &message,
                                                error.code());
                }
            }

            if self.kernel.termination_requested() {
                break;
            }
        }

        if self.process != 0 {
            self.kernel.close_handle(self.process);
        }

        if self.arbiter != 0 {
            self.kernel.close_handle(self.arbiter);
        }

        self.kernel.close_handle(kernel_event);
        self.kernel.close_handle(session);
        self.kernel.close_handle(client);
        self.kernel.close_handle(server);
    }

    /// Swap or exit notification from the kernel
    fn handle_kernel_event(&mut self) {
        let event = self.kernel.read_pa(map::PLG_STATUS_PA) & !0xffff;

        if event == EVENT_EXIT {
            // Give the plugin a chance to clean up before the process
            // is torn down
            self.rendezvous.notify(&mut self.kernel, self.arbiter,
                                   EVENT_ABOUT_TO_EXIT, false);
            self.rendezvous.wait_reply(&mut self.kernel, self.arbiter);
        } else if event == EVENT_SWAP {
            self.frontend.set_led(true);

            if self.plugin_is_swapped {
                self.swap_in();
            } else {
                self.swap_out();
            }

            self.plugin_is_swapped = !self.plugin_is_swapped;
            self.frontend.set_led(false);
        }
    }

    /// Evict the plugin to the swap file and give its memory back
    fn swap_out(&mut self) {
        self.rendezvous.notify(&mut self.kernel, self.arbiter,
                               EVENT_ABOUT_TO_SWAP, false);
        self.rendezvous.wait_reply(&mut self.kernel, self.arbiter);

        let _ = self.kernel.schedule_threads(self.process, true,
                                             TLS_MAGIC);

        let _ = self.arena.unmount_from(&mut self.kernel, self.process,
                                        &self.header);

        self.arena.to_swap(&mut self.kernel, &self.sdmc);

        if let Err(e) = self.arena.release(&mut self.kernel) {
            self.pending_error = Some(e);
        }

        self.set_status(STATUS_SWAPPED);

        info!("plugin swapped out");
    }

    /// Bring the plugin back from the swap file
    fn swap_in(&mut self) {
        if let Err(e) = self.arena.acquire(&mut self.kernel) {
            // There's no way back: the plugin state only exists in
            // the swap file and we just lost the means to restore it
            panic!("couldn't reacquire the arena for swap-in: {}", e);
        }

        self.arena.from_swap(&mut self.kernel, &self.sdmc);

        let _ = self.arena.mount_in(&mut self.kernel, self.process,
                                    &self.header);

        let _ = self.kernel.schedule_threads(self.process, false,
                                             TLS_MAGIC);

        self.rendezvous.notify(&mut self.kernel, self.arbiter,
                               EVENT_OK, true);

        self.set_status(STATUS_RUNNING);

        info!("plugin swapped back in");
    }

    /// The target process is going away: unmap, free, forget
    fn teardown_target(&mut self) {
        let _ = self.arena.unmount_from(&mut self.kernel, self.process,
                                        &self.header);

        if let Err(e) = self.arena.release(&mut self.kernel) {
            self.pending_error = Some(e);
        }

        self.kernel.close_handle(self.process);

        self.set_status(STATUS_NONE);
        self.plugin_is_swapped = false;
        self.process = 0;

        self.frontend.ir_unpatch();

        info!("target exited, loader reset");
    }

    fn set_status(&mut self, status: u32) {
        self.kernel.write_pa(map::PLG_STATUS_PA, status);
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn target(&self) -> Handle {
        self.process
    }

    pub fn arbiter(&self) -> Handle {
        self.arbiter
    }

    pub fn is_swapped(&self) -> bool {
        self.plugin_is_swapped
    }

    pub fn current_path(&self) -> &str {
        &self.path_current
    }

    /// The entry instructions displaced by the hook. The trampoline
    /// stub replays these before jumping back into the game.
    pub fn saved_game_instr(&self) -> [u32; 2] {
        self.saved_game_instr
    }
}
