//! Touch report monitoring and offline decoding

use crate::buses::Device;
use std::sync::mpsc;
use std::sync::Arc;
use syntcm_core::report::{ContactChanges, ReportDecoder};
use syntcm_core::{DispatchEvent, LayoutProgram, TouchFrameResult};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn print_frame(frame: &TouchFrameResult, changes: Option<&ContactChanges>) {
    if frame.gesture_code != 0 {
        println!(
            "gesture 0x{:02x} ({})",
            frame.gesture_code,
            frame.gesture_name()
        );
        for (x, y) in frame.gesture_points().iter().filter(|p| **p != (0, 0)) {
            println!("  point ({}, {})", x, y);
        }
        if let Some(fp) = frame.fingerprint() {
            println!("  fingerprint {:?}", fp);
        }
    }
    for p in frame.touch_points() {
        println!(
            "slot {:2} down  x={:5} y={:5} major={} minor={}",
            p.slot, p.x, p.y, p.touch_major, p.width_major
        );
    }
    if let Some(changes) = changes {
        for slot in 0..frame.objects.len().min(32) {
            if changes.lifted & (1 << slot) != 0 {
                println!("slot {:2} up", slot);
            }
        }
    }
}

/// Parse a hex string, ignoring whitespace, `:` and an optional `0x`
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.len() % 2 != 0 {
        return Err("Hex string has an odd number of digits".to_string());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| format!("Invalid hex byte: {}", &digits[i..i + 2]))
        })
        .collect()
}

pub fn cmd_decode(layout: &str, report: &str, max_objects: usize) -> CmdResult {
    let program: LayoutProgram = layout.parse()?;
    let bytes = parse_hex_bytes(report)?;
    let frame = ReportDecoder::new(program, max_objects).decode(&bytes)?;

    println!("{} bytes, {} active object(s)", bytes.len(), frame.active_count());
    if let Some(n) = frame.num_active_objects {
        println!("object count field: {}", n);
    }
    if frame.timestamp != 0 {
        println!("timestamp: {}", frame.timestamp);
    }
    print_frame(&frame, None);
    Ok(())
}

pub fn cmd_monitor(device: Device, count: Option<usize>, gesture: bool) -> CmdResult {
    device.initialize()?;
    if gesture {
        device.enter_gesture_mode()?;
        device.set_suspended(true);
    }

    let device = Arc::new(device);
    let (tx, rx) = mpsc::channel();
    let poller = device.spawn_poller(move |event| {
        // receiver gone means we are shutting down
        let _ = tx.send(event);
    })?;
    let recovery = device.start_recovery()?;

    println!("Waiting for touch reports (Ctrl-C to stop)...");
    let mut seen = 0usize;
    while count.map_or(true, |c| seen < c) {
        let Ok(event) = rx.recv() else { break };
        match event {
            DispatchEvent::Touch { frame, changes } => {
                seen += 1;
                println!("-- report {} --", seen);
                print_frame(&frame, Some(&changes));
            }
            DispatchEvent::Identify(info) => {
                println!(
                    "controller reset (mode 0x{:02x}), reconfiguring",
                    u8::from(info.mode)
                );
            }
            DispatchEvent::TouchHold => println!("touch-and-hold"),
            DispatchEvent::Log => log::debug!("log report received"),
            DispatchEvent::Dropped(code) => log::debug!("report 0x{:02x} dropped", code),
            _ => {}
        }
    }

    poller.stop();
    device.stop_recovery();
    recovery.join();
    if gesture {
        device.set_suspended(false);
        device.enter_normal_mode()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("0x01a2ff"), Ok(vec![0x01, 0xA2, 0xFF]));
        assert_eq!(parse_hex_bytes("01 a2:ff"), Ok(vec![0x01, 0xA2, 0xFF]));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn test_decode_command() {
        cmd_decode(
            "num_active_objects:8, foreach_active_object, object_index:4, classification:4, pad_to_next_byte, foreach_end, end",
            "01 12",
            10,
        )
        .unwrap();
        assert!(cmd_decode("bogus_op:8", "00", 10).is_err());
    }
}
