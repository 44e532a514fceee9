//! Drop-in shim exposing the Bladed-style `DISCON` entry point.
//!
//! The host simulator loads this library exactly like a local controller.
//! Every call is serialized into a frame, shipped to the manager over one
//! persistent websocket, executed remotely, and the mutated buffers are
//! copied back in place before the call returns.

use std::ffi::c_char;
use std::sync::{Mutex, OnceLock};

use tracing::error;

use discon_proto::{SWAP_INFILE_LEN, SWAP_MSG_LEN, SWAP_OUTNAME_LEN, SWAP_SWAP_LEN};

mod session;
mod staging;

use session::{CallBuffers, SessionSlot};

static SESSION: OnceLock<Mutex<SessionSlot>> = OnceLock::new();

fn session_slot() -> &'static Mutex<SessionSlot> {
    SESSION.get_or_init(|| Mutex::new(SessionSlot::Uninit))
}

/// The standard controller entry point. Buffer capacities are read from the
/// distinguished swap indices exactly as the ABI specifies; the pointers are
/// only used for the duration of this call.
///
/// # Safety
///
/// `avr_swap` must point to at least `avr_swap[128]` floats and the three
/// character buffers must match the capacities advertised in the swap array.
#[no_mangle]
pub unsafe extern "C" fn DISCON(
    avr_swap: *mut f32,
    avi_fail: *mut i32,
    acc_infile: *mut c_char,
    avc_outname: *mut c_char,
    avc_msg: *mut c_char,
) {
    if avr_swap.is_null() || avi_fail.is_null() {
        return;
    }

    let swap_size = avr_swap.add(SWAP_SWAP_LEN).read() as usize;
    let msg_size = avr_swap.add(SWAP_MSG_LEN).read() as usize;
    let in_file_size = avr_swap.add(SWAP_INFILE_LEN).read() as usize;
    let out_name_size = avr_swap.add(SWAP_OUTNAME_LEN).read() as usize;
    if swap_size <= SWAP_SWAP_LEN {
        *avi_fail = 1;
        return;
    }

    let swap = std::slice::from_raw_parts_mut(avr_swap, swap_size);
    let in_file = buffer_mut(acc_infile, in_file_size);
    let out_name = buffer_mut(avc_outname, out_name_size);
    let msg = buffer_mut(avc_msg, msg_size);

    let mut buffers = CallBuffers {
        swap,
        fail: &mut *avi_fail,
        in_file,
        out_name,
        msg,
    };

    let mut slot = session_slot().lock().unwrap_or_else(|e| e.into_inner());
    match slot.get_or_connect() {
        Ok(session) => {
            if let Err(err) = session.call(&mut buffers) {
                report_failure(&mut buffers, &format!("{err:#}"));
            }
        }
        Err(msg) => report_failure(&mut buffers, &msg),
    }
}

unsafe fn buffer_mut<'a>(ptr: *mut c_char, len: usize) -> &'a mut [u8] {
    if ptr.is_null() || len == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(ptr as *mut u8, len)
    }
}

/// Controller failures are reported the way a local library would: non-zero
/// fail flag and a NUL-terminated message in the ABI's message buffer.
fn report_failure(b: &mut CallBuffers, text: &str) {
    error!("{text}");
    *b.fail = 1;
    if b.msg.is_empty() {
        return;
    }
    let n = text.len().min(b.msg.len() - 1);
    b.msg[..n].copy_from_slice(&text.as_bytes()[..n]);
    b.msg[n] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_is_nul_terminated() {
        let mut swap = [0.0f32; 130];
        let mut fail = 0i32;
        let mut in_file = *b"input.txt\0";
        let mut out_name = [0u8; 11];
        let mut msg = [0u8; 16];
        let mut buffers = CallBuffers {
            swap: &mut swap,
            fail: &mut fail,
            in_file: &mut in_file,
            out_name: &mut out_name,
            msg: &mut msg,
        };

        report_failure(&mut buffers, "File transfer failed: nope");
        assert_eq!(fail, 1);
        assert_eq!(&msg[..15], b"File transfer f");
        assert_eq!(msg[15], 0);
    }

    #[test]
    fn failure_report_tolerates_missing_msg_buffer() {
        let mut swap = [0.0f32; 130];
        let mut fail = 0i32;
        let mut buffers = CallBuffers {
            swap: &mut swap,
            fail: &mut fail,
            in_file: &mut [],
            out_name: &mut [],
            msg: &mut [],
        };
        report_failure(&mut buffers, "boom");
        assert_eq!(fail, 1);
    }
}
