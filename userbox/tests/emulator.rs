//! Emulator integration tests, driven through the scripted engine.

mod common;

use common::{null_os, FixtureLoader, SharedBuf};
use userbox::arch::x86_64::{RAX, RSP};
use userbox::cpu::{Cpu, MemAccess, RegId};
use userbox::loader::{LoadType, Loader, LoaderError};
use userbox::{Config, EmuError, Emulator, Process, STACK_SIZE};
use userbox_cpu_mock::{Event, ScriptedCpu};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn read_u64<C: Cpu>(emu: &mut Emulator<C>, addr: u64) -> u64 {
    let bytes = emu.mem_read(addr, 8).unwrap();
    u64::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn static_exec_maps_at_fixed_addresses() {
    let data = payload(0x1000);
    let loader = FixtureLoader::new(LoadType::Exec, 0x400100).segment(
        0x400000,
        0x1000,
        data.clone(),
    );
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), Config::default())
            .unwrap();

    assert_eq!(emu.base(), 0);
    assert_eq!(emu.interp_base(), 0);
    assert_eq!(emu.bin_entry(), 0x400100);
    assert_eq!(emu.entry(), 0x400100);
    assert!(emu.cpu_mut().map_calls.contains(&(0x400000, 0x1000)));
    assert_eq!(emu.mem_read(0x400000, 0x1000).unwrap(), data);
}

#[test]
fn unknown_load_type_is_rejected() {
    let loader = FixtureLoader::new(LoadType::Unknown, 0);
    let err = Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), Config::default())
        .unwrap_err();
    assert!(matches!(err, EmuError::UnsupportedLoadType));
}

#[test]
fn dyn_with_interpreter_gets_two_biases() {
    let mut main = FixtureLoader::new(LoadType::Dyn, 0x1200)
        .segment(0, 0x2000, b"MAIN".to_vec())
        .symbol("main", 0x100, 0x200);
    main.interp = Some("/lib/ld.so".into());

    let resolve = |path: &str| -> Result<Box<dyn Loader>, LoaderError> {
        assert_eq!(path, "/lib/ld.so");
        Ok(Box::new(
            FixtureLoader::new(LoadType::Dyn, 0x500)
                .segment(0, 0x3000, b"INTERP".to_vec())
                .symbol("_start", 0x10, 0x40),
        ))
    };
    let mut emu = Emulator::with_resolver(
        ScriptedCpu::new(),
        Box::new(main),
        null_os(),
        Config::default(),
        Some(Box::new(resolve)),
    )
    .unwrap();

    let (base, interp_base) = (emu.base(), emu.interp_base());
    assert_ne!(base, 0);
    assert_ne!(interp_base, 0);
    assert_ne!(base, interp_base);
    assert_eq!(emu.bin_entry(), base + 0x1200);
    assert_eq!(emu.entry(), interp_base + 0x500);
    assert_eq!(emu.mem_read(base, 4).unwrap(), b"MAIN");
    assert_eq!(emu.mem_read(interp_base, 6).unwrap(), b"INTERP");

    // symbolication spans both tables
    assert_eq!(emu.symbolicate(base + 0x150).as_deref(), Some("main+0x50"));
    assert_eq!(emu.symbolicate(interp_base + 0x20).as_deref(), Some("_start+0x10"));
    assert_eq!(emu.symbolicate(0), None);
}

#[test]
fn missing_resolver_fails_interpreter_load() {
    let mut main = FixtureLoader::new(LoadType::Dyn, 0x1200).segment(0, 0x2000, Vec::new());
    main.interp = Some("/lib/ld.so".into());
    let err = Emulator::new(ScriptedCpu::new(), Box::new(main), null_os(), Config::default())
        .unwrap_err();
    assert!(matches!(err, EmuError::NoResolver(path) if path == "/lib/ld.so"));
}

#[test]
fn setup_stack_points_sp_at_the_top() {
    let loader = FixtureLoader::new(LoadType::Exec, 0x400100).segment(0x400000, 0x1000, Vec::new());
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), Config::default())
            .unwrap();
    emu.setup_stack().unwrap();
    let sp = emu.reg_read(RSP).unwrap();
    assert_eq!(sp, emu.process().stack_base() + STACK_SIZE);
}

#[test]
fn posix_init_builds_the_abi_stack() {
    let loader = FixtureLoader::new(LoadType::Exec, 0x400100).segment(0x400000, 0x1000, Vec::new());
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), Config::default())
            .unwrap();
    emu.setup_stack().unwrap();
    let top = emu.reg_read(RSP).unwrap();

    let args = vec!["prog".to_string(), "a".to_string()];
    let env = vec!["X=1".to_string()];
    emu.posix_init(&args, &env, &[0u8; 16]).unwrap();

    let sp = emu.reg_read(RSP).unwrap();
    assert_eq!(top - sp, 72);

    // argc
    assert_eq!(read_u64(&mut emu, sp), 2);
    // argv pointers in natural order, then the terminator
    let argv0 = read_u64(&mut emu, sp + 8);
    let argv1 = read_u64(&mut emu, sp + 16);
    assert_eq!(read_u64(&mut emu, sp + 24), 0);
    assert_eq!(emu.mem_read(argv0, 5).unwrap(), b"prog\0");
    assert_eq!(emu.mem_read(argv1, 2).unwrap(), b"a\0");
    // envp pointer, then the terminator
    let envp0 = read_u64(&mut emu, sp + 32);
    assert_eq!(read_u64(&mut emu, sp + 40), 0);
    assert_eq!(emu.mem_read(envp0, 4).unwrap(), b"X=1\0");
    // auxv blob, then the end marker
    assert_eq!(emu.mem_read(sp + 48, 16).unwrap(), vec![0u8; 16]);
    assert_eq!(read_u64(&mut emu, sp + 64), 0);
}

#[test]
fn brk_grows_monotonically() {
    let mut loader =
        FixtureLoader::new(LoadType::Exec, 0x400100).segment(0x400000, 0x1000, Vec::new());
    loader.data_segment = (0x500000, 0x501000);
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), Config::default())
            .unwrap();

    assert_eq!(emu.brk(0).unwrap(), 0x501000);
    assert_eq!(emu.brk(0x502000).unwrap(), 0x502000);
    assert!(emu.cpu_mut().map_calls.contains(&(0x501000, 0x1000)));
    assert_eq!(emu.brk(0).unwrap(), 0x502000);
    // the new range is writable guest memory
    emu.mem_write(0x501800, b"heap").unwrap();
}

#[test]
fn brk_propagates_mapping_failures() {
    let mut loader =
        FixtureLoader::new(LoadType::Exec, 0x400100).segment(0x400000, 0x1000, Vec::new());
    loader.data_segment = (0x500000, 0x501000);
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), Config::default())
            .unwrap();

    // something else already lives where the break would grow
    emu.mem_map(0x501000, 0x1000).unwrap();
    assert!(emu.brk(0x502000).is_err());
    assert_eq!(emu.brk(0).unwrap(), 0x501000);
}

#[test]
fn prefix_path_redirects_absolute_guest_paths() {
    let dir = tempfile::tempdir().unwrap();
    let loader = FixtureLoader::new(LoadType::Exec, 0x400100).segment(0x400000, 0x1000, Vec::new());
    let config = Config { load_prefix: Some(dir.path().to_path_buf()), ..Config::default() };
    let emu = Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), config).unwrap();

    let expect = dir.path().join("lib/ld.so").to_string_lossy().into_owned();
    // forced redirection ignores filesystem state
    assert_eq!(emu.prefix_path("/lib/ld.so", true), expect);
    // unforced redirection needs the target to exist
    assert_eq!(emu.prefix_path("/lib/ld.so", false), "/lib/ld.so");
    std::fs::create_dir_all(dir.path().join("etc")).unwrap();
    std::fs::write(dir.path().join("etc/hosts"), b"x").unwrap();
    let expect = dir.path().join("etc/hosts").to_string_lossy().into_owned();
    assert_eq!(emu.prefix_path("/etc/hosts", false), expect);
    // relative paths are never redirected
    assert_eq!(emu.prefix_path("lib/ld.so", true), "lib/ld.so");
}

fn traced_emulator(config: Config) -> (Emulator<ScriptedCpu>, SharedBuf) {
    let loader = FixtureLoader::new(LoadType::Exec, 0x400100)
        .segment(0x400000, 0x1000, payload(0x1000))
        .symbol("_start", 0x400100, 0x400200);
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), null_os(), config).unwrap();
    let buf = SharedBuf::new();
    emu.set_trace_output(Box::new(buf.clone()));
    (emu, buf)
}

#[test]
fn deadlock_is_detected_and_stops_the_engine() {
    let (mut emu, buf) =
        traced_emulator(Config { trace_exec: true, trace_reg: true, ..Config::default() });
    emu.cpu_mut().script(vec![
        Event::Code { addr: 0x400100, size: 4 },
        Event::Code { addr: 0x400100, size: 4 },
        Event::Code { addr: 0x400100, size: 4 },
        Event::Code { addr: 0x400100, size: 4 },
        Event::Code { addr: 0x400200, size: 4 },
    ]);
    emu.run(&[], &[]).unwrap();

    assert_eq!(emu.cpu_mut().stop_calls, 1);
    assert!(buf
        .contents()
        .contains("FATAL: deadlock detected at 0x400100 (_start+0x0)"));
}

#[test]
fn repeated_address_below_threshold_is_tolerated() {
    let (mut emu, buf) =
        traced_emulator(Config { trace_exec: true, trace_reg: true, ..Config::default() });
    emu.cpu_mut().script(vec![
        Event::Code { addr: 0x400100, size: 4 },
        Event::Code { addr: 0x400100, size: 4 },
        Event::Code { addr: 0x400100, size: 4 },
    ]);
    emu.run(&[], &[]).unwrap();
    assert_eq!(emu.cpu_mut().stop_calls, 0);
    assert!(!buf.contents().contains("FATAL"));
}

#[test]
fn register_movement_resets_the_deadlock_counter() {
    let (mut emu, buf) = traced_emulator(Config { trace_exec: true, ..Config::default() });
    let mut tape = Vec::new();
    for i in 0..8u64 {
        tape.push(Event::Code { addr: 0x400100, size: 4 });
        tape.push(Event::SetReg { reg: RAX, value: i + 1 });
    }
    emu.cpu_mut().script(tape);
    emu.run(&[], &[]).unwrap();
    assert_eq!(emu.cpu_mut().stop_calls, 0);
    assert!(!buf.contents().contains("FATAL"));
}

#[test]
fn block_trace_lines_carry_symbols_and_depth() {
    let (mut emu, buf) = traced_emulator(Config { trace_exec: true, ..Config::default() });
    emu.cpu_mut().set_disas(0x400100, "xor eax, eax");
    emu.cpu_mut().script(vec![
        Event::Block { addr: 0x400100, size: 16 },
        Event::Code { addr: 0x400100, size: 2 },
    ]);
    emu.run(&[], &[]).unwrap();

    let out = buf.contents();
    assert!(out.contains("+ block (_start+0x0) @0x400100"));
    assert!(out.contains("xor eax, eax"));
}

#[test]
fn memory_trace_lines_are_word_padded() {
    let (mut emu, buf) = traced_emulator(Config { trace_mem: true, ..Config::default() });
    emu.cpu_mut().script(vec![
        Event::Mem { access: MemAccess::Write, addr: 0x400000, size: 4, value: 0x1234 },
        Event::Mem { access: MemAccess::Read, addr: 0x400010, size: 8, value: -1 },
    ]);
    emu.run(&[], &[]).unwrap();

    let out = buf.contents();
    assert!(out.contains("W 0x0000000000400000 4 0x0000000000001234"));
    assert!(out.contains("R 0x0000000000400010 8 0xffffffffffffffff"));
}

#[test]
fn invalid_memory_faults_and_dumps_state() {
    let (mut emu, buf) = traced_emulator(Config::default());
    emu.cpu_mut().script(vec![Event::InvalidMem {
        access: MemAccess::WriteInvalid,
        addr: 0xdead0000,
        size: 4,
        value: 0x55,
    }]);
    let err = emu.run(&[], &[]).unwrap_err();
    assert!(matches!(err, EmuError::Cpu(_)));

    let out = buf.contents();
    assert!(out.contains("invalid write: @0xdead0000, 0x4 = 0x55"));
    assert!(out.contains("Registers:"));
    assert!(out.contains("Stacktrace:"));
}

#[test]
fn interrupts_route_to_the_os_table() {
    fn recording_interrupt(_proc: &mut Process<ScriptedCpu>, cpu: &mut ScriptedCpu, intno: u32) {
        cpu.reg_write(RegId(999), u64::from(intno)).unwrap();
    }

    let loader = FixtureLoader::new(LoadType::Exec, 0x400100).segment(0x400000, 0x1000, Vec::new());
    let os = userbox::Os {
        name: "test",
        init: None,
        interrupt: recording_interrupt,
        syscall_name: |_| None,
    };
    let mut emu =
        Emulator::new(ScriptedCpu::new(), Box::new(loader), os, Config::default()).unwrap();
    emu.cpu_mut().script(vec![Event::Intr { intno: 3 }]);
    emu.run(&[], &[]).unwrap();
    assert_eq!(emu.reg_read(RegId(999)).unwrap(), 3);
}

#[test]
fn verbose_run_dumps_entry_state() {
    let (mut emu, buf) = traced_emulator(Config { verbose: true, ..Config::default() });
    emu.cpu_mut().set_disas(0x400100, "0x400100: xor eax, eax");
    emu.run(&[], &[]).unwrap();

    let out = buf.contents();
    assert!(out.contains("[entry @ 0x400100]"));
    assert!(out.contains("0x400100: xor eax, eax"));
    assert!(out.contains("==== Program output begins here. ===="));
    // the initial full register dump
    assert!(out.contains("rsp = 0x"));
}

#[test]
fn run_reaches_the_engine_with_the_entry_point() {
    let (mut emu, _buf) = traced_emulator(Config::default());
    emu.run(&[], &[]).unwrap();
    assert_eq!(emu.cpu_mut().started, Some((0x400100, u64::MAX)));
}
