//! Pinned BPF objects: the ledger's memory, the perf event arrays holding each
//! slot's counters, and the program that reads them.
//!
//! A perf event array created with `BPF_F_PRESERVE_ELEMS` keeps its events
//! after the process that inserted them closes its descriptors, for as long
//! as the array lives, and a pin in bpffs keeps the array alive until it is
//! unpinned. An event in an array can only be read by
//! `bpf_perf_event_read_value()` running on the event's CPU, so every reader
//! loads a small raw tracepoint program and test-runs it on each CPU with
//! `BPF_F_TEST_RUN_ON_CPU`. The program copies the value into a per-CPU array
//! private to the reader.

use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::mem;
use std::os::raw::{c_char, c_void};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr;
use std::sync::{Mutex, PoisonError};

use libbpf_rs::libbpf_sys;
use libbpf_rs::{MapCore, MapFlags, MapHandle, MapType};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, trace};

use crate::error::{new_error, Error, ErrorKind};
use crate::reading::CounterReading;

// Value size of the ledger array. Elements of an mmapable array are laid out
// back to back, so word-sized values give one contiguous mapping.
const LEDGER_WORD: usize = 8;

const READING_SIZE: usize = mem::size_of::<CounterReading>();

fn check(rc: libc::c_int) -> Result<libc::c_int, Error> {
    if rc < 0 {
        return Err(io::Error::from_raw_os_error(-rc).into());
    }
    Ok(rc)
}

fn create_opts(map_flags: u32) -> libbpf_sys::bpf_map_create_opts {
    libbpf_sys::bpf_map_create_opts {
        sz: mem::size_of::<libbpf_sys::bpf_map_create_opts>() as _,
        map_flags,
        ..Default::default()
    }
}

fn pin(map: &MapHandle, path: &Path) -> Result<(), Error> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::with_context(ErrorKind::Config, e))?;
    check(unsafe { libbpf_sys::bpf_obj_pin(map.as_fd().as_raw_fd(), path.as_ptr()) })?;
    Ok(())
}

// The map pinned at `path`, or None if nothing is pinned there.
fn open_pinned(path: &Path) -> Result<Option<MapHandle>, Error> {
    match MapHandle::from_pinned_path(path) {
        Ok(map) => Ok(Some(map)),
        Err(e) if matches!(e.kind(), libbpf_rs::ErrorKind::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn info(map: &MapHandle, path: &Path, map_type: u32) -> Result<libbpf_sys::bpf_map_info, Error> {
    let mut info = libbpf_sys::bpf_map_info::default();
    let mut len = mem::size_of_val(&info) as u32;
    check(unsafe {
        libbpf_sys::bpf_obj_get_info_by_fd(
            map.as_fd().as_raw_fd(),
            &mut info as *mut _ as *mut c_void,
            &mut len,
        )
    })?;

    if info.type_ != map_type {
        return Err(Error::with_context(
            ErrorKind::IncompatibleMap,
            format!("{} is a map of type {}", path.display(), info.type_),
        ));
    }
    Ok(info)
}

/// The number of CPU ids the kernel may ever use, the size of every per-CPU
/// table.
pub(crate) fn possible_cpus() -> Result<usize, Error> {
    Ok(libbpf_rs::num_possible_cpus()?)
}

/// Map the ledger array pinned at `path`, creating and pinning a zeroed one
/// of `len` bytes if there is none.
pub(crate) fn ledger_map(path: &Path, len: usize) -> Result<MmapMut, Error> {
    let map = match open_pinned(path)? {
        Some(map) => map,
        None => {
            let map = MapHandle::create(
                MapType::Array,
                Some("bperf_ledger"),
                mem::size_of::<u32>() as u32,
                LEDGER_WORD as u32,
                len.div_ceil(LEDGER_WORD) as u32,
                &create_opts(libbpf_sys::BPF_F_MMAPABLE),
            )?;
            pin(&map, path)?;
            debug!(path = %path.display(), len, "pinned ledger");
            map
        }
    };

    let info = info(&map, path, libbpf_sys::BPF_MAP_TYPE_ARRAY)?;
    if info.map_flags & libbpf_sys::BPF_F_MMAPABLE == 0 {
        return Err(Error::with_context(
            ErrorKind::IncompatibleMap,
            format!("{} cannot be memory mapped", path.display()),
        ));
    }

    let len = info.value_size as usize * info.max_entries as usize;
    // The mapping holds its own reference on the array.
    Ok(unsafe { MmapOptions::new().len(len).map_mut(map.as_fd().as_raw_fd())? })
}

/// A perf event array holding one slot's counters, indexed by CPU.
#[derive(Debug)]
pub(crate) struct EventArray {
    map: MapHandle,
}

impl EventArray {
    /// Put `events` into a new array. Once the array holds them the caller
    /// may close its descriptors.
    pub(crate) fn create<'a>(
        events: impl Iterator<Item = (i32, &'a File)>,
    ) -> Result<Self, Error> {
        let map = MapHandle::create(
            MapType::PerfEventArray,
            Some("bperf_events"),
            mem::size_of::<u32>() as u32,
            mem::size_of::<u32>() as u32,
            possible_cpus()? as u32,
            &create_opts(libbpf_sys::BPF_F_PRESERVE_ELEMS),
        )?;

        for (cpu, file) in events {
            let fd: RawFd = file.as_raw_fd();
            map.update(
                &(cpu as u32).to_ne_bytes(),
                &fd.to_ne_bytes(),
                MapFlags::ANY,
            )?;
        }
        Ok(Self { map })
    }

    pub(crate) fn pin(&self, path: &Path) -> Result<(), Error> {
        pin(&self.map, path)
    }

    /// The array pinned at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        let map = open_pinned(path)?.ok_or_else(|| {
            Error::with_context(
                ErrorKind::Config,
                format!("no counters pinned at {}", path.display()),
            )
        })?;
        info(&map, path, libbpf_sys::BPF_MAP_TYPE_PERF_EVENT_ARRAY)?;
        Ok(Self { map })
    }

    /// Take every event out of the array pinned at `path`, which frees the
    /// counters, then unpin it.
    pub(crate) fn destroy(path: &Path) -> Result<(), Error> {
        let array = Self::open(path)?;
        let info = info(&array.map, path, libbpf_sys::BPF_MAP_TYPE_PERF_EVENT_ARRAY)?;
        for cpu in 0..info.max_entries {
            match array.map.delete(&cpu.to_ne_bytes()) {
                Ok(()) => {}
                Err(e) if matches!(e.kind(), libbpf_rs::ErrorKind::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        fs::remove_file(path)?;
        debug!(path = %path.display(), "unpinned counters");
        Ok(())
    }

    /// Load a program reading this array.
    pub(crate) fn reader(&self) -> Result<Reader, Error> {
        Reader::load(&self.map)
    }
}

/// Reads the events of one [`EventArray`] from this process.
#[derive(Debug)]
pub(crate) struct Reader {
    prog: OwnedFd,
    values: MapHandle,
    lock: Mutex<()>,
}

impl Reader {
    fn load(events: &MapHandle) -> Result<Self, Error> {
        let values = MapHandle::create(
            MapType::PercpuArray,
            Some("bperf_value"),
            mem::size_of::<u32>() as u32,
            READING_SIZE as u32,
            1,
            &create_opts(0),
        )?;

        let insns = read_value_program(events.as_fd().as_raw_fd(), values.as_fd().as_raw_fd());
        debug_assert_eq!(mem::size_of::<Insn>(), mem::size_of::<libbpf_sys::bpf_insn>());
        let fd = check(unsafe {
            libbpf_sys::bpf_prog_load(
                libbpf_sys::BPF_PROG_TYPE_RAW_TRACEPOINT,
                b"bperf_read\0".as_ptr() as *const c_char,
                b"GPL\0".as_ptr() as *const c_char,
                insns.as_ptr() as *const libbpf_sys::bpf_insn,
                insns.len() as _,
                ptr::null_mut(),
            )
        })?;

        Ok(Self {
            // SAFETY: fd was just returned by the kernel and is owned by
            // nobody else.
            prog: unsafe { OwnedFd::from_raw_fd(fd) },
            values,
            lock: Mutex::new(()),
        })
    }

    /// Sum the counters of `cpus`. CPUs without an event in the array are
    /// skipped.
    pub(crate) fn read(&self, cpus: &[i32]) -> Result<CounterReading, Error> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut read = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let mut opts = libbpf_sys::bpf_test_run_opts {
                sz: mem::size_of::<libbpf_sys::bpf_test_run_opts>() as _,
                flags: libbpf_sys::BPF_F_TEST_RUN_ON_CPU,
                cpu: cpu as u32,
                ..Default::default()
            };
            check(unsafe {
                libbpf_sys::bpf_prog_test_run_opts(self.prog.as_raw_fd(), &mut opts)
            })?;

            match opts.retval as i32 {
                0 => read.push(cpu as usize),
                rc if rc == -libc::ENOENT => trace!(cpu, "no counter on cpu"),
                rc => return Err(io::Error::from_raw_os_error(-rc).into()),
            }
        }

        let values = self
            .values
            .lookup_percpu(&0u32.to_ne_bytes(), MapFlags::ANY)?
            .ok_or_else(|| new_error(ErrorKind::State))?;

        let mut total = CounterReading::default();
        for cpu in read {
            let value = values
                .get(cpu)
                .filter(|v| v.len() >= READING_SIZE)
                .ok_or_else(|| new_error(ErrorKind::State))?;
            total += parse_reading(value);
        }
        Ok(total)
    }
}

fn parse_reading(buf: &[u8]) -> CounterReading {
    let word = |i: usize| {
        let mut w = [0u8; 8];
        w.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
        u64::from_ne_bytes(w)
    };
    CounterReading {
        counter: word(0),
        enabled: word(1),
        running: word(2),
    }
}

/// One eBPF instruction, laid out like `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Insn {
    code: u8,
    regs: u8,
    off: i16,
    imm: i32,
}

const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const R3: u8 = 3;
const R4: u8 = 4;
const R10: u8 = 10;

const LD_IMM64: u8 = 0x18; // BPF_LD | BPF_IMM | BPF_DW
const MOV32_IMM: u8 = 0xb4; // BPF_ALU | BPF_MOV | BPF_K
const MOV64_IMM: u8 = 0xb7; // BPF_ALU64 | BPF_MOV | BPF_K
const MOV64_REG: u8 = 0xbf; // BPF_ALU64 | BPF_MOV | BPF_X
const ADD64_IMM: u8 = 0x07; // BPF_ALU64 | BPF_ADD | BPF_K
const ST_W: u8 = 0x62; // BPF_ST | BPF_MEM | BPF_W
const JNE_IMM: u8 = 0x55; // BPF_JMP | BPF_JNE | BPF_K
const CALL: u8 = 0x85; // BPF_JMP | BPF_CALL
const EXIT: u8 = 0x95; // BPF_JMP | BPF_EXIT

const PSEUDO_MAP_FD: u8 = 1;
const FUNC_MAP_UPDATE_ELEM: i32 = 2;
const FUNC_PERF_EVENT_READ_VALUE: i32 = 55;

impl Insn {
    const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        #[cfg(target_endian = "little")]
        let regs = dst | src << 4;
        #[cfg(target_endian = "big")]
        let regs = dst << 4 | src;
        Self {
            code,
            regs,
            off,
            imm,
        }
    }

    fn ld_map_fd(dst: u8, fd: RawFd) -> [Self; 2] {
        [
            Self::new(LD_IMM64, dst, PSEUDO_MAP_FD, 0, fd),
            Self::new(0, 0, 0, 0, 0),
        ]
    }
}

/// ```text
/// struct bpf_perf_event_value v;          // fp - 24
/// u32 key = 0;                            // fp - 28
/// r0 = bpf_perf_event_read_value(&events, BPF_F_CURRENT_CPU, &v, sizeof(v));
/// if (r0 == 0)
///     r0 = bpf_map_update_elem(&values, &key, &v, BPF_ANY);
/// return r0;
/// ```
fn read_value_program(events: RawFd, values: RawFd) -> Vec<Insn> {
    let value_off = -(READING_SIZE as i32);
    let key_off = value_off - 4;

    let mut insns = vec![];
    insns.extend(Insn::ld_map_fd(R1, events));
    insns.extend([
        // BPF_F_CURRENT_CPU, zero extended.
        Insn::new(MOV32_IMM, R2, 0, 0, -1),
        Insn::new(MOV64_REG, R3, R10, 0, 0),
        Insn::new(ADD64_IMM, R3, 0, 0, value_off),
        Insn::new(MOV64_IMM, R4, 0, 0, READING_SIZE as i32),
        Insn::new(CALL, 0, 0, 0, FUNC_PERF_EVENT_READ_VALUE),
    ]);

    let update = [
        Insn::new(ST_W, R10, 0, key_off as i16, 0),
        Insn::new(MOV64_REG, R2, R10, 0, 0),
        Insn::new(ADD64_IMM, R2, 0, 0, key_off),
        Insn::new(MOV64_REG, R3, R10, 0, 0),
        Insn::new(ADD64_IMM, R3, 0, 0, value_off),
    ];
    let [ld_values, ld_values_hi] = Insn::ld_map_fd(R1, values);
    let update_len = update.len() + 2 + 2;

    insns.push(Insn::new(JNE_IMM, R0, 0, update_len as i16, 0));
    insns.extend(update);
    insns.extend([ld_values, ld_values_hi]);
    insns.extend([
        Insn::new(MOV64_IMM, R4, 0, 0, 0),
        Insn::new(CALL, 0, 0, 0, FUNC_MAP_UPDATE_ELEM),
        Insn::new(EXIT, 0, 0, 0, 0),
    ]);
    insns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_value_program() {
        let insns = read_value_program(3, 4);
        assert_eq!(insns.len(), 18);

        // Both map loads carry the pseudo map fd tag.
        assert_eq!(insns[0].code, LD_IMM64);
        assert_eq!(insns[0].imm, 3);
        assert_eq!(insns[13].code, LD_IMM64);
        assert_eq!(insns[13].imm, 4);
        assert_eq!(insns[13].regs, insns[0].regs);
        assert_eq!(insns[0].regs, Insn::new(0, R1, PSEUDO_MAP_FD, 0, 0).regs);

        // A failed read jumps straight to the exit.
        let jne = insns.iter().position(|i| i.code == JNE_IMM).unwrap();
        let exit = insns.len() - 1;
        assert_eq!(jne as i16 + 1 + insns[jne].off, exit as i16);
        assert_eq!(insns[exit].code, EXIT);
    }

    #[test]
    fn test_insn_layout() {
        assert_eq!(mem::size_of::<Insn>(), 8);
        let i = Insn::new(MOV64_REG, R3, R10, -2, 7);
        assert_eq!(i.off, -2);
        assert_eq!(i.imm, 7);
    }

    #[test]
    fn test_parse_reading() {
        let mut buf = vec![];
        for w in [5u64, 20, 10] {
            buf.extend_from_slice(&w.to_ne_bytes());
        }
        let r = parse_reading(&buf);
        assert_eq!(r.counter, 5);
        assert_eq!(r.scaled(), 10);
    }
}
