//! Pseudoterminal scenarios: cooked-mode editing feeding guest reads, and
//! guest writes surfacing as terminal output events.

use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use wasi_workbench::{
    GuestMemory, MemoryFileSystem, MountDescriptor, Pseudoterminal, PseudoterminalOptions,
    Syscall, TerminalEvent, WasiProcess, WasiProcessBuilder,
};

async fn terminal_process(pty: Arc<Pseudoterminal>) -> Result<WasiProcess, Error> {
    Ok(WasiProcessBuilder::new("guest")
        .mount(MountDescriptor::MemoryFs {
            fs: MemoryFileSystem::new(),
            mount_point: "/tmp".to_string(),
            readonly: false,
        })
        .terminal(pty)
        .build()
        .await?)
}

fn one_iovec(memory: &GuestMemory, iovs_ptr: u32, buf_ptr: u32, len: u32) {
    memory.write_u32(iovs_ptr, buf_ptr).unwrap();
    memory.write_u32(iovs_ptr + 4, len).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn line_editing_reaches_the_guest() -> Result<(), Error> {
    let pty = Pseudoterminal::new(PseudoterminalOptions::default());
    let process = terminal_process(pty.clone()).await?;
    let memory = process.memory().clone();
    let buffer = process.start_worker(1, tokio::runtime::Handle::current());

    let guest = std::thread::spawn(move || {
        one_iovec(&memory, 800, 900, 64);
        // Blocks until a line is committed.
        assert_eq!(buffer.call(Syscall::FdRead, &[0, 800, 1, 808]), 0);
        let nread = memory.read_u32(808).unwrap();
        assert_eq!(memory.read_bytes(900, nread).unwrap(), b"h!i\n");
        assert_eq!(buffer.call(Syscall::ProcExit, &[0]), 0);
    });

    // Let the guest block in readline, then type with a cursor-left edit:
    // h, i, left, '!', enter.
    tokio::time::sleep(Duration::from_millis(20)).await;
    pty.input(b"hi\x1b[D!\r");

    let code = process.run().await;
    guest.join().expect("guest thread");
    assert_eq!(code, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_output_is_published_as_events() -> Result<(), Error> {
    let pty = Pseudoterminal::new(PseudoterminalOptions::default());
    let mut events = pty.attach();
    let process = terminal_process(pty.clone()).await?;
    let memory = process.memory().clone();
    let buffer = process.start_worker(1, tokio::runtime::Handle::current());

    let guest = std::thread::spawn(move || {
        memory.write_bytes(900, b"printed").unwrap();
        one_iovec(&memory, 800, 900, 7);
        assert_eq!(buffer.call(Syscall::FdWrite, &[1, 800, 1, 808]), 0);
        assert_eq!(memory.read_u32(808).unwrap(), 7);
        assert_eq!(buffer.call(Syscall::ProcExit, &[0]), 0);
    });

    process.run().await;
    guest.join().expect("guest thread");

    let mut output = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TerminalEvent::Output(bytes) = event {
            output.extend_from_slice(&bytes);
        }
    }
    assert_eq!(output, b"printed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_uses_insert_sequences_mid_line() -> Result<(), Error> {
    let pty = Pseudoterminal::new(PseudoterminalOptions::default());
    let mut events = pty.attach();
    pty.input(b"ab\x1b[D!");

    let mut echoed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TerminalEvent::Output(bytes) = event {
            echoed.extend_from_slice(&bytes);
        }
    }
    // "ab", cursor left, then insert-char before echoing '!'.
    assert_eq!(echoed, b"ab\x1b[D\x1b[@!");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_resolves_a_blocked_read_with_newline() -> Result<(), Error> {
    let pty = Pseudoterminal::new(PseudoterminalOptions::default());
    let mut events = pty.attach();
    let process = terminal_process(pty.clone()).await?;
    let memory = process.memory().clone();
    let buffer = process.start_worker(1, tokio::runtime::Handle::current());

    let guest = std::thread::spawn(move || {
        one_iovec(&memory, 800, 900, 64);
        assert_eq!(buffer.call(Syscall::FdRead, &[0, 800, 1, 808]), 0);
        let nread = memory.read_u32(808).unwrap();
        assert_eq!(memory.read_bytes(900, nread).unwrap(), b"\n");
        assert_eq!(buffer.call(Syscall::ProcExit, &[130]), 0);
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    pty.input(&[0x03]); // ^C

    let code = process.run().await;
    guest.join().expect("guest thread");
    assert_eq!(code, 130);

    let mut saw_interrupt = false;
    while let Ok(event) = events.try_recv() {
        if event == TerminalEvent::Interrupt {
            saw_interrupt = true;
        }
    }
    assert!(saw_interrupt);
    Ok(())
}
