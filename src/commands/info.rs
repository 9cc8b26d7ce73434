//! Query and control commands

use crate::buses::{self, Device};
use syntcm_core::{AppInfo, BootInfo, IdentifyInfo};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

pub fn list_buses() {
    println!("Supported buses:");
    println!();
    for b in buses::available_buses() {
        println!("  {:10} - {}", b.name, b.description);
        if !b.aliases.is_empty() {
            println!("  {:10}   aliases: {}", "", b.aliases.join(", "));
        }
    }
}

fn print_identify(info: &IdentifyInfo) {
    println!("Part number:    {}", info.part_number());
    println!("Build ID:       {}", info.build_id);
    println!("Firmware mode:  0x{:02x} ({:?})", u8::from(info.mode), info.mode);
    println!("Max write size: {} bytes", info.max_write_size);
}

fn print_app_info(info: &AppInfo) {
    println!("Application info:");
    println!("  Status:               0x{:04x}", info.status);
    println!("  Customer config ID:   {}", info.customer_config_id());
    println!("  Resolution:           {} x {}", u32::from(info.max_x) + 1, u32::from(info.max_y) + 1);
    println!("  Max objects:          {}", info.max_objects);
    println!("  Buttons:              {}", info.num_of_buttons);
    println!(
        "  Image:                {} rows x {} cols",
        info.num_of_image_rows, info.num_of_image_cols
    );
    println!("  Report config size:   {} bytes", info.max_touch_report_config_size);
    println!("  Report payload size:  {} bytes", info.max_touch_report_payload_size);
}

fn print_boot_info(info: &BootInfo) {
    println!("Bootloader info:");
    println!("  Status:               0x{:02x}", info.status);
    println!("  ASIC ID:              0x{:04x}", info.asic_id);
    println!("  Write block size:     {} bytes", info.write_block_size());
    println!("  Erase page size:      {} bytes", info.erase_page_size());
    println!("  Max write payload:    {} bytes", info.max_write_payload_size);
    println!("  Last reset reason:    0x{:02x}", info.last_reset_reason);
}

pub fn cmd_identify(device: &Device) -> CmdResult {
    let info = device.identify()?;
    print_identify(&info);
    Ok(())
}

pub fn cmd_info(device: &Device) -> CmdResult {
    let info = device.identify()?;
    print_identify(&info);
    println!();
    if info.mode.is_application() {
        print_app_info(&device.app_info());
    } else {
        print_boot_info(&device.boot_info());
    }
    Ok(())
}

pub fn cmd_get_config(device: &Device, id: u8) -> CmdResult {
    device.initialize()?;
    let value = device.get_dynamic_config(id)?;
    println!("0x{:02x} = 0x{:04x} ({})", id, value, value);
    Ok(())
}

pub fn cmd_set_config(device: &Device, id: u8, value: u16) -> CmdResult {
    device.initialize()?;
    device.set_dynamic_config(id, value)?;
    println!("0x{:02x} set to 0x{:04x}", id, value);
    Ok(())
}

pub fn cmd_sleep(device: &Device, enter: bool) -> CmdResult {
    device.identify()?;
    device.sleep(enter)?;
    println!("{}", if enter { "Entered deep sleep" } else { "Left deep sleep" });
    Ok(())
}

pub fn cmd_reset(device: &Device) -> CmdResult {
    let info = device.reset()?;
    println!("Reset complete");
    print_identify(&info);
    Ok(())
}

pub fn cmd_collect(device: &Device, code: u8, count: usize) -> CmdResult {
    device.initialize()?;
    let reports = device.collect_reports(code, count)?;
    for (n, report) in reports.iter().enumerate() {
        println!("Report 0x{:02x} #{} ({} bytes):", code, n, report.len());
        for line in report.chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
            println!("  {}", hex.join(" "));
        }
    }
    Ok(())
}
