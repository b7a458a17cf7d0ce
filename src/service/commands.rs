//! Decoding and dispatch of the ten `plg:ldr` commands.
//!
//! Every command validates the full shape of its header (opcode,
//! normal word count, translate word count) before touching any
//! state; a mismatch replies with the fixed malformed-request code
//! and leaves the loader untouched.

use std::cmp;

use inject;
use inject::LoadOverride;
use kernel::ipc;
use kernel::{map, Kernel};

use super::{Loader, STATUS_RUNNING};

/// Reply to a request whose header doesn't match the command
pub const ERR_MALFORMED_REQUEST: u32 = 0xd9001830;

/// Reply to an opcode we don't implement
pub const ERR_UNKNOWN_COMMAND: u32 = 0xd900182f;

/// Magenta, pushed straight into the LED color register
const LED_FLASH_COLOR: u32 = 0x01ff9933;
const LED_FLASH_PULSES: u32 = 64;
const LED_FLASH_DELAY_NS: u64 = 5_000_000;

pub fn handle_commands<K: Kernel>(loader: &mut Loader<K>) {
    let command = loader.kernel.cmd_buf()[0] >> 16;

    match command {
        1 => load_plugin(loader),
        2 => is_enabled(loader),
        3 => set_enabled(loader),
        4 => set_load_override(loader),
        5 => display_menu(loader),
        6 => display_message(loader),
        7 => display_error_message(loader),
        8 => get_version(loader),
        9 => get_arbiter(loader),
        10 => get_plugin_path(loader),
        _ => ipc::error_reply(loader.kernel.cmd_buf(),
                              ERR_UNKNOWN_COMMAND),
    }
}

/// Validate the header shape, reply with the malformed-request code
/// if it's off
fn expect<K: Kernel>(loader: &mut Loader<K>, command: u32,
                     normal: u32, translate: u32) -> bool {
    let cmdbuf = loader.kernel.cmd_buf();

    if cmdbuf[0] == ipc::make_header(command, normal, translate) {
        true
    } else {
        ipc::error_reply(cmdbuf, ERR_MALFORMED_REQUEST);

        false
    }
}

/// Command 1: a game process was just created, try to inject a plugin
/// into it. The reply is always a success, a failed load simply
/// releases the handle (and surfaces its error out of band).
fn load_plugin<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 1, 0, 2) {
        return;
    }

    let process = loader.kernel.cmd_buf()[2];

    loader.process = process;

    let loaded =
        if loader.settings.enabled {
            let res = inject::try_to_load_plugin(
                &mut loader.kernel, &loader.sdmc, &mut loader.arena,
                &loader.rendezvous, loader.arbiter, &mut loader.stub,
                &mut loader.load_override, process);

            match res {
                Ok(Some(outcome)) => {
                    loader.header = outcome.header;
                    loader.path_current = outcome.path;
                    loader.saved_game_instr = outcome.saved_game_instr;

                    true
                }
                Ok(None) => false,
                Err(e) => {
                    loader.pending_error = Some(e);

                    false
                }
            }
        } else {
            false
        };

    if loaded {
        if loader.load_override.is_none() && loader.no_flash {
            // The override asked for a silent load; it's good for one
            // load only
            loader.no_flash = false;
        } else {
            // A little flash to notify the user that the plugin is
            // loaded
            for _ in 0..LED_FLASH_PULSES {
                loader.kernel.write_pa(map::LED_REG_PA,
                                       LED_FLASH_COLOR);
                loader.kernel.sleep_thread(LED_FLASH_DELAY_NS);
            }

            loader.kernel.write_pa(map::LED_REG_PA, 0);
        }

        loader.frontend.ir_patch();
        loader.set_status(STATUS_RUNNING);
    } else {
        loader.kernel.close_handle(process);
        loader.process = 0;
    }

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(1, 1, 0);
    cmdbuf[1] = 0;
}

/// Command 2: is the plugin loader enabled?
fn is_enabled<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 2, 0, 0) {
        return;
    }

    let enabled = loader.settings.enabled;
    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(2, 2, 0);
    cmdbuf[1] = 0;
    cmdbuf[2] = enabled as u32;
}

/// Command 3: enable or disable the loader, persisting the choice
fn set_enabled<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 3, 1, 0) {
        return;
    }

    let requested = loader.kernel.cmd_buf()[1] != 0;

    if requested != loader.settings.enabled {
        loader.settings.enabled = requested;
        loader.frontend.save_settings(&loader.settings);
        loader.frontend.update_menu(requested);
    }

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(3, 1, 0);
    cmdbuf[1] = 0;
}

/// Command 4: parameters for the next load of a given title
fn set_load_override<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 4, 2, 4) {
        return;
    }

    let (no_flash, title_id, path_desc, path_ptr, config_ptr) = {
        let cmdbuf = loader.kernel.cmd_buf();

        (cmdbuf[1] != 0, cmdbuf[2], cmdbuf[3], cmdbuf[4], cmdbuf[6])
    };

    let path_len =
        cmp::min(ipc::static_buffer_size(path_desc) as usize, 255);

    let mut path_buf = vec![0u8; path_len];

    if loader.kernel.copy_from_user(path_ptr, &mut path_buf).is_err() {
        ipc::error_reply(loader.kernel.cmd_buf(),
                         ERR_MALFORMED_REQUEST);
        return;
    }

    let end = path_buf.iter().position(|&b| b == 0)
        .unwrap_or(path_len);
    let path = String::from_utf8_lossy(&path_buf[..end]).into_owned();

    let mut config_bytes = [0u8; 128];

    if loader.kernel.copy_from_user(config_ptr,
                                    &mut config_bytes).is_err() {
        ipc::error_reply(loader.kernel.cmd_buf(),
                         ERR_MALFORMED_REQUEST);
        return;
    }

    let mut config = [0u32; 32];

    for (i, word) in config.iter_mut().enumerate() {
        let b = &config_bytes[i * 4..i * 4 + 4];

        *word = b[0] as u32
            | (b[1] as u32) << 8
            | (b[2] as u32) << 16
            | (b[3] as u32) << 24;
    }

    info!("next load of title {:08x} overridden with {}",
          title_id, path);

    loader.load_override = Some(LoadOverride {
        title_id: title_id,
        path: path,
        config: config,
        no_flash: no_flash,
    });
    loader.no_flash = no_flash;

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(4, 1, 0);
    cmdbuf[1] = 0;
}

/// Command 5: blocking menu prompt. The state bitmap travels both
/// ways, the reply echoes the buffer back to the caller.
fn display_menu<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 5, 1, 8) {
        return;
    }

    let (nb_items, states_ptr) = {
        let cmdbuf = loader.kernel.cmd_buf();

        (cmdbuf[1], cmdbuf[3])
    };

    let mut states = vec![0u8; nb_items as usize];

    if loader.kernel.copy_from_user(states_ptr, &mut states).is_err() {
        ipc::error_reply(loader.kernel.cmd_buf(),
                         ERR_MALFORMED_REQUEST);
        return;
    }

    loader.frontend.display_menu(nb_items, &mut states);

    let _ = loader.kernel.copy_to_user(states_ptr, &states);

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(5, 1, 2);
    cmdbuf[1] = 0;
    cmdbuf[2] = ipc::desc_buffer(nb_items, ipc::BUFFER_RW);
    cmdbuf[3] = states_ptr;
}

/// Command 6: blocking informational prompt
fn display_message<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 6, 0, 4) {
        return;
    }

    let (title_desc, title_ptr, body_desc, body_ptr) = {
        let cmdbuf = loader.kernel.cmd_buf();

        (cmdbuf[1], cmdbuf[2], cmdbuf[3], cmdbuf[4])
    };

    let title = read_string(&mut loader.kernel, title_desc, title_ptr);
    let body = read_string(&mut loader.kernel, body_desc, body_ptr);

    loader.frontend.display_message(&title, &body);

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(6, 1, 0);
    cmdbuf[1] = 0;
}

/// Command 7: blocking error prompt with a result code
fn display_error_message<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 7, 1, 4) {
        return;
    }

    let (code, title_desc, title_ptr, body_desc, body_ptr) = {
        let cmdbuf = loader.kernel.cmd_buf();

        (cmdbuf[1], cmdbuf[2], cmdbuf[3], cmdbuf[4], cmdbuf[5])
    };

    let title = read_string(&mut loader.kernel, title_desc, title_ptr);
    let body = read_string(&mut loader.kernel, body_desc, body_ptr);

    loader.frontend.display_error(&title, &body, code);

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(7, 1, 0);
    cmdbuf[1] = 0;
}

/// Command 8: packed loader version
fn get_version<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 8, 0, 0) {
        return;
    }

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(8, 2, 0);
    cmdbuf[1] = 0;
    cmdbuf[2] = ::VERSION_WORD;
}

/// Command 9: share the address arbiter so plugins can wait on the
/// rendezvous words
fn get_arbiter<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 9, 0, 0) {
        return;
    }

    let arbiter = loader.arbiter;
    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(9, 1, 2);
    cmdbuf[1] = 0;
    cmdbuf[2] = ipc::desc_shared_handles(1);
    cmdbuf[3] = arbiter;
}

/// Command 10: path of the plugin currently injected
fn get_plugin_path<K: Kernel>(loader: &mut Loader<K>) {
    if !expect(loader, 10, 0, 2) {
        return;
    }

    let path_ptr = loader.kernel.cmd_buf()[2];

    // Fixed 255 byte window, zero padded
    let mut buf = [0u8; 255];
    let path = loader.path_current.as_bytes();
    let len = cmp::min(path.len(), buf.len());

    buf[..len].copy_from_slice(&path[..len]);

    let _ = loader.kernel.copy_to_user(path_ptr, &buf);

    let cmdbuf = loader.kernel.cmd_buf();

    cmdbuf[0] = ipc::make_header(10, 1, 2);
    cmdbuf[1] = 0;
    cmdbuf[2] = ipc::desc_buffer(255, ipc::BUFFER_RW);
    cmdbuf[3] = path_ptr;
}

/// Pull a NUL-terminated string out of a static IPC buffer
fn read_string<K: Kernel>(kernel: &mut K, desc: u32, ptr: u32)
                          -> String {
    let len = ipc::static_buffer_size(desc) as usize;

    let mut buf = vec![0u8; len];

    if kernel.copy_from_user(ptr, &mut buf).is_err() {
        return String::new();
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(len);

    String::from_utf8_lossy(&buf[..end]).into_owned()
}
