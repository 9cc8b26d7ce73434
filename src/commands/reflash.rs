//! Firmware reflash command

use crate::buses::Device;
use crate::cli::parse_hex_u32;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use syntcm_core::{ReflashProgress, ReflashRegion};

const SPINNER_TEMPLATE: &str = "{spinner:.green} {msg}";
const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Shows one spinner per erase and one bar per region write
pub struct IndicatifProgress {
    multi: MultiProgress,
    bar: Option<ProgressBar>,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bar: None,
            spinner_style: ProgressStyle::with_template(SPINNER_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            bar_style: ProgressStyle::with_template(BAR_TEMPLATE)
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        }
    }

    fn finish_current(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ReflashProgress for IndicatifProgress {
    fn erasing(&mut self, address: u32, pages: u32) {
        self.finish_current();
        let spinner = self.multi.add(ProgressBar::new_spinner());
        spinner.set_style(self.spinner_style.clone());
        spinner.set_message(format!("erase {} page(s) at 0x{:08X}", pages, address));
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.bar = Some(spinner);
    }

    fn writing(&mut self, address: u32, total_bytes: usize) {
        self.finish_current();
        let bar = self.multi.add(ProgressBar::new(total_bytes as u64));
        bar.set_style(self.bar_style.clone());
        bar.set_message(format!("write 0x{:08X}", address));
        self.bar = Some(bar);
    }

    fn write_progress(&mut self, bytes_written: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(bytes_written as u64);
        }
    }

    fn complete(&mut self) {
        self.finish_current();
    }
}

/// Parse `<address>:<file>`
pub fn parse_region_arg(arg: &str) -> Result<(u32, PathBuf), String> {
    let (addr, file) = arg
        .split_once(':')
        .ok_or_else(|| format!("Invalid region '{}', expected <address>:<file>", arg))?;
    if file.is_empty() {
        return Err(format!("Missing file in region '{}'", arg));
    }
    Ok((parse_hex_u32(addr)?, PathBuf::from(file)))
}

pub fn cmd_reflash(device: &Device, regions: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut loaded = Vec::with_capacity(regions.len());
    for arg in regions {
        let (address, path) = parse_region_arg(arg)?;
        let data = fs::read(&path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?;
        println!(
            "Region 0x{:08X}: {} bytes from {:?}",
            address,
            data.len(),
            path
        );
        loaded.push(ReflashRegion::new(address, data));
    }

    let info = device.identify()?;
    println!(
        "Reflashing {} (build {})",
        info.part_number(),
        info.build_id
    );

    let mut progress = IndicatifProgress::new();
    device.reflash(&loaded, &mut progress)?;

    let info = device.identify_info();
    println!(
        "Reflash complete, running {} in mode 0x{:02x}",
        info.part_number(),
        u8::from(info.mode)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region_arg() {
        assert_eq!(
            parse_region_arg("0x2000:fw.bin"),
            Ok((0x2000, PathBuf::from("fw.bin")))
        );
        assert_eq!(
            parse_region_arg("4096:/tmp/a:b.bin"),
            Ok((4096, PathBuf::from("/tmp/a:b.bin")))
        );
        assert!(parse_region_arg("fw.bin").is_err());
        assert!(parse_region_arg("0x10:").is_err());
        assert!(parse_region_arg("zz:fw.bin").is_err());
    }
}
