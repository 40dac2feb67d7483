use std::fs::File;
use std::io::Write;
use std::os::unix::prelude::FileExt;

use fat::{BlockDevice, BootSector, FatVolume, FileHandle, SECTOR_SIZE};

/// Disk image on the host file system.
struct FileDisk {
    file: File,
}

impl BlockDevice for FileDisk {
    fn read_sectors(&mut self, lba: u32, count: u8, out: &mut [u8]) -> bool {
        let len = usize::from(count) * SECTOR_SIZE;
        let Some(out) = out.get_mut(..len) else {
            return false;
        };
        self.file
            .read_exact_at(out, u64::from(lba) * SECTOR_SIZE as u64)
            .is_ok()
    }

    fn write_sectors(&mut self, lba: u32, count: u8, data: &[u8]) -> bool {
        let len = usize::from(count) * SECTOR_SIZE;
        let Some(data) = data.get(..len) else {
            return false;
        };
        self.file
            .write_all_at(data, u64::from(lba) * SECTOR_SIZE as u64)
            .is_ok()
    }
}

fn main() {
    // Get command line arguments: a FAT disk file, and optionally a path in it
    let args: Vec<String> = std::env::args().collect();
    let (disk_file, path) = match &args[..] {
        [_, disk_file] => (disk_file, "/"),
        [_, disk_file, path] => (disk_file, path.as_str()),
        _ => {
            eprintln!("Usage: {} <disk_file> [path]", args[0]);
            std::process::exit(1);
        }
    };

    println!("Reading FAT disk file: {disk_file}");
    let file = File::open(disk_file).expect("failed to open disk file");
    let mut disk = FileDisk { file };
    let boot = BootSector::read(&mut disk).expect("failed to read boot sector");
    println!(
        "OEM name: {:?}, volume label: {:?}",
        String::from_utf8_lossy(boot.oem_name()),
        String::from_utf8_lossy(boot.volume_label()),
    );

    let mut volume = FatVolume::initialize(disk).unwrap_or_else(|err| {
        eprintln!("failed to mount {disk_file}: {err}");
        std::process::exit(1);
    });
    println!("{:#X?}", volume.geometry());

    let handle = volume.open(path).unwrap_or_else(|err| {
        eprintln!("{path}: {err}");
        std::process::exit(1);
    });
    let is_directory = volume.is_directory(handle).expect("handle was just opened");
    if is_directory {
        list(&mut volume, handle);
    } else {
        dump(&mut volume, handle);
    }
    volume.close(handle);
}

fn list(volume: &mut FatVolume<FileDisk>, dir: FileHandle) {
    loop {
        let entry = match volume.read_entry(dir) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                eprintln!("failed to read directory: {err}");
                std::process::exit(1);
            }
        };
        if entry.is_end_marker() {
            break;
        }
        if !entry.is_visible() {
            continue;
        }
        let kind = if entry.is_directory() { "<DIR>" } else { "" };
        println!(
            "{:<12} {kind:>5} {:>10} cluster {}",
            entry.name().to_string(),
            entry.size(),
            entry.first_cluster()
        );
    }
}

fn dump(volume: &mut FatVolume<FileDisk>, file: FileHandle) {
    let mut stdout = std::io::stdout().lock();
    let mut buf = [0; 4096];
    loop {
        match volume.read(file, &mut buf) {
            Ok(0) => break,
            Ok(read) => stdout
                .write_all(&buf[..read])
                .expect("failed to write to stdout"),
            Err(err) => {
                eprintln!("read failed: {err}");
                std::process::exit(1);
            }
        }
    }
}
