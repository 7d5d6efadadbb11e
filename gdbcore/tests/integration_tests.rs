/// Integration tests for the debugger-control core
///
/// Each test drives a `DebugSession` against the scripted debugger in
/// `common`, so operations run through the real engine and observer.

mod common;

use std::time::Duration;

use common::{console, FakeGdb, ENTRY, PID};
use gdbcore::companion::{read_frame, write_frame, CompanionChannel, CompanionReply, CompanionRequest};
use gdbcore::*;
use serde_json::json;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_connect_configures_debugger() {
    let fake = FakeGdb::connect().await;
    assert!(fake.session.is_initialized());
    assert!(!fake.session.is_attached());
    assert_eq!(
        &fake.commands()[..3],
        ["-gdb-set mi-async on", "set pagination off", "set confirm off"]
    );
}

#[tokio::test]
async fn test_adopt_inferior_prepares_session() {
    let fake = FakeGdb::attached().await;
    let info = fake.session.info();
    assert_eq!(info.pid, PID);
    assert_eq!(info.status, InferiorStatus::Stopped);
    assert_eq!(info.arch, InferiorArch::X64);
    assert!(fake.runtime_dir.join(PID.to_string()).is_dir());
}

#[tokio::test]
async fn test_concurrent_commands_get_their_own_responses() {
    let fake = FakeGdb::attached().await;
    let mut tasks = Vec::new();
    for i in 0..16u64 {
        let session = fake.session.clone();
        tasks.push(tokio::spawn(async move {
            let address = 0x1000 + i * 0x10;
            let info = session.examine_expression(&format!("{address:#x}")).await.unwrap();
            (address, info.address)
        }));
    }
    for task in tasks {
        let (expected, got) = task.await.unwrap();
        assert_eq!(got, Some(expected));
    }
}

#[tokio::test]
async fn test_console_output_is_attributed_and_async_records_broadcast() {
    let fake = FakeGdb::attached().await;
    let (_id, mut events) = fake.session.subscribe();
    fake.set_handler(|command| {
        (command == "info sharedlibrary").then(|| {
            vec![
                "=library-loaded,id=\"/lib/libc.so.6\"".to_string(),
                console("From                To\n"),
                "^done".to_string(),
            ]
        })
    });

    let response = fake.session.execute("info sharedlibrary").await.unwrap();
    assert_eq!(response.console, "From                To\n");
    assert!(!response.is_error());

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(event.starts_with("=library-loaded"));
}

#[tokio::test]
async fn test_cancel_last_command_interrupts_debugger() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| (command == "info proc mappings").then(Vec::new));

    let pending = {
        let session = fake.session.clone();
        tokio::spawn(async move { session.execute("info proc mappings").await })
    };
    fake.wait_for_command("info proc mappings").await;
    while !pending.is_finished() {
        fake.session.cancel_last_command();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = pending.await.unwrap().unwrap();
    assert!(response.is_empty());
    assert!(fake.commands().contains(&"<ctrl-c>".to_string()));

    // The engine is usable again
    let info = fake.session.examine_expression("0x10").await.unwrap();
    assert_eq!(info.address, Some(0x10));
}

#[tokio::test]
async fn test_execute_after_detach_fails() {
    let fake = FakeGdb::attached().await;
    assert_ok!(fake.session.detach().await);
    assert!(!fake.session.is_initialized());
    assert_eq!(fake.session.status(), InferiorStatus::Uninitialized);
    assert!(matches!(
        fake.session.execute("info registers").await,
        Err(CoreError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_user_stops_are_announced() {
    let fake = FakeGdb::attached().await;
    assert_ok!(fake.session.continue_inferior().await);
    assert_eq!(fake.session.status(), InferiorStatus::Running);

    let changed = fake.session.status_change();
    fake.emit("*stopped,reason=\"breakpoint-hit\",bkptno=\"9\",thread-id=\"1\"");
    assert!(tokio::time::timeout(WAIT, changed.wait()).await.unwrap());
    assert_eq!(fake.session.status(), InferiorStatus::Stopped);
    assert_eq!(fake.session.info().stop_reason, StopReason::Debug);
}

#[tokio::test]
async fn test_internal_stops_are_not_announced() {
    let fake = FakeGdb::attached().await;
    let number = fake
        .session
        .track_breakpoint("0x401010", &["$rax".to_string()])
        .await
        .unwrap()
        .unwrap();
    fake.session.continue_inferior().await.unwrap();

    let changed = fake.session.status_change();
    fake.emit(&format!(
        "*stopped,reason=\"breakpoint-hit\",bkptno=\"{number}\",thread-id=\"1\""
    ));
    // The tracker examines its expressions and resumes on its own
    fake.wait_for_command("-data-evaluate-expression \"(void*)($rax)\"").await;
    fake.wait_for_command("c&").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tokio::time::timeout(Duration::from_millis(100), changed.wait())
        .await
        .is_err());
    assert_eq!(fake.session.status(), InferiorStatus::Running);
}

#[tokio::test]
async fn test_hardware_breakpoints_fall_back_to_software() {
    let fake = FakeGdb::attached().await;
    for i in 0..5u64 {
        let number = fake
            .session
            .add_breakpoint(&format!("{:#x}", ENTRY + i * 0x10), BreakpointKind::Hardware, OnHit::Break)
            .await
            .unwrap();
        assert_eq!(number, Some((i + 1).to_string()));
    }
    assert_eq!(
        fake.state.lock().unwrap().breakpoint_types(),
        ["hw breakpoint", "hw breakpoint", "hw breakpoint", "hw breakpoint", "breakpoint"]
    );

    let listed = fake.session.list_breakpoints().await.unwrap();
    assert_eq!(listed.len(), 5);
    assert_eq!(listed[4].kind, BreakpointKind::Software);
    assert!(!fake.session.hardware_breakpoint_available().await.unwrap());
}

#[tokio::test]
async fn test_breakpoint_on_covered_address_is_refused() {
    let fake = FakeGdb::attached().await;
    let first = fake
        .session
        .add_breakpoint("0x401000", BreakpointKind::Software, OnHit::Break)
        .await
        .unwrap();
    assert!(first.is_some());
    let second = fake
        .session
        .add_breakpoint("0x401000", BreakpointKind::Software, OnHit::Break)
        .await
        .unwrap();
    assert_eq!(second, None);

    let bad = fake
        .session
        .add_breakpoint("no_such_symbol", BreakpointKind::Software, OnHit::Break)
        .await
        .unwrap();
    assert_eq!(bad, None);
}

#[tokio::test]
async fn test_watchpoint_chain_is_split_and_deleted_together() {
    let fake = FakeGdb::attached().await;
    let numbers = fake
        .session
        .add_watchpoint("0x601000", 12, WatchpointType::WriteOnly, OnHit::Break)
        .await
        .unwrap();
    assert_eq!(numbers, ["1", "2"]);
    assert!(fake
        .commands()
        .contains(&"-break-watch \"*(char[4] *) 0x601008\"".to_string()));

    let covered = fake.session.breakpoints_in_range(0x60100b, 1).await.unwrap();
    assert_eq!(covered.len(), 1);
    assert_eq!(covered[0].size, 4);

    // Any address inside the chain removes every chunk
    assert!(fake.session.delete_breakpoint("0x601009").await.unwrap());
    assert!(fake.session.list_breakpoints().await.unwrap().is_empty());
    assert!(!fake.session.delete_breakpoint("0x601000").await.unwrap());
}

#[tokio::test]
async fn test_modify_chain_applies_condition_to_every_chunk() {
    let fake = FakeGdb::attached().await;
    fake.session
        .add_watchpoint("0x601000", 16, WatchpointType::Both, OnHit::Break)
        .await
        .unwrap();
    let modified = fake
        .session
        .modify_breakpoint("0x601000", &BreakpointModification::Condition("$rax==1".into()))
        .await
        .unwrap();
    assert!(modified);
    assert_eq!(
        fake.state.lock().unwrap().breakpoint_conditions(),
        [Some("$rax==1".to_string()), Some("$rax==1".to_string())]
    );

    let zero = fake
        .session
        .modify_breakpoint("0x601000", &BreakpointModification::EnableCount(0))
        .await
        .unwrap();
    assert!(!zero);
}

#[tokio::test]
async fn test_watchpoints_respect_hardware_slots() {
    let fake = FakeGdb::attached().await;
    // 40 bytes need five slots; only four exist
    let numbers = fake
        .session
        .add_watchpoint("0x602000", 40, WatchpointType::ReadOnly, OnHit::Break)
        .await
        .unwrap();
    assert_eq!(numbers.len(), HARDWARE_SLOTS);
    assert!(fake
        .session
        .add_watchpoint("0x603000", 4, WatchpointType::ReadOnly, OnHit::Break)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_trace_records_requested_steps() {
    let fake = FakeGdb::attached().await;
    let options = TraceOptions {
        max_steps: 5,
        collect_registers: false,
        ..TraceOptions::default()
    };
    let handle = fake.session.start_trace("main", options).await.unwrap().unwrap();
    assert_eq!(handle.status(), TraceStatus::Idle);
    assert!(matches!(
        fake.session.start_trace("main", TraceOptions::default()).await,
        Err(CoreError::TraceActive)
    ));

    fake.session.continue_inferior().await.unwrap();
    fake.emit(&format!(
        "*stopped,reason=\"breakpoint-hit\",bkptno=\"{}\",thread-id=\"1\"",
        handle.id()
    ));

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(status, TraceStatus::Finished);
    assert_eq!(handle.step_count(), 5);
    let tree = handle.tree().unwrap();
    assert_eq!(tree.step_count(), 5);
    assert!(tree.nodes[1].instruction.contains("mov    eax, 0x1"));
    // The trigger breakpoint is gone
    assert!(fake.session.list_breakpoints().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_trace_cancelled_before_trigger() {
    let fake = FakeGdb::attached().await;
    let handle = fake
        .session
        .start_trace("main", TraceOptions::default())
        .await
        .unwrap()
        .unwrap();
    fake.session.cancel_trace();

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(status, TraceStatus::Canceled);
    assert_eq!(handle.tree().unwrap().step_count(), 0);
    assert!(fake.session.trace().is_some_and(|t| !t.is_active()));
}

#[tokio::test]
async fn test_trace_with_zero_steps_is_rejected() {
    let fake = FakeGdb::attached().await;
    let options = TraceOptions {
        max_steps: 0,
        ..TraceOptions::default()
    };
    assert!(fake.session.start_trace("main", options).await.unwrap().is_none());
    assert!(fake.session.list_breakpoints().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_companion_answers_examine_requests() {
    let fake = FakeGdb::attached().await;
    let (ours, theirs) = tokio::net::UnixStream::pair().unwrap();
    fake.session
        .set_companion(CompanionChannel::new(ours, WAIT))
        .await;

    let extension = tokio::spawn(async move {
        let mut theirs = theirs;
        let request: CompanionRequest = read_frame(&mut theirs).await.unwrap();
        let reply = CompanionReply::success(json!([
            {"all": "0x401000 <main>", "address": 0x401000, "symbol": "<main>"}
        ]));
        write_frame(&mut theirs, &reply).await.unwrap();
        request
    });

    let info = fake.session.examine_expression("main").await.unwrap();
    assert_eq!(info.address, Some(0x401000));
    assert_eq!(info.symbol.as_deref(), Some("<main>"));

    let request = extension.await.unwrap();
    assert_eq!(request.command, "examine_expressions");
    assert_eq!(request.args, json!(["main"]));
    assert!(fake.commands().iter().any(|c| c == "tracehound-examine-expressions"));
}

#[tokio::test]
async fn test_operations_need_a_process() {
    let fake = FakeGdb::connect().await;
    assert!(matches!(
        fake.session.start_trace("main", TraceOptions::default()).await,
        Err(CoreError::NoProcess)
    ));
    assert!(matches!(
        fake.session.dissect_code(&[(0x1000, 0x2000)], true).await,
        Err(CoreError::NoProcess)
    ));
}

#[tokio::test]
async fn test_concurrent_hardware_breakpoints_share_the_last_slot() {
    let fake = FakeGdb::attached().await;
    for i in 0..3u64 {
        fake.session
            .add_breakpoint(&format!("{:#x}", ENTRY + i * 0x10), BreakpointKind::Hardware, OnHit::Break)
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for i in 3..6u64 {
        let session = fake.session.clone();
        tasks.push(tokio::spawn(async move {
            session
                .add_breakpoint(&format!("{:#x}", ENTRY + i * 0x10), BreakpointKind::Hardware, OnHit::Break)
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().unwrap().is_some());
    }

    let types = fake.state.lock().unwrap().breakpoint_types();
    assert_eq!(types.len(), 6);
    assert_eq!(types.iter().filter(|t| *t == "hw breakpoint").count(), HARDWARE_SLOTS);
}

#[tokio::test]
async fn test_watchpoint_past_the_address_space_is_refused() {
    let fake = FakeGdb::attached().await;
    let numbers = fake
        .session
        .add_watchpoint("0xfffffffffffffffc", 8, WatchpointType::Both, OnHit::Break)
        .await
        .unwrap();
    assert!(numbers.is_empty());
    assert!(!fake.commands().iter().any(|c| c.starts_with("-break-watch")));
}

#[tokio::test]
async fn test_only_one_of_two_racing_traces_starts() {
    let fake = FakeGdb::attached().await;
    let first = fake.session.clone();
    let second = fake.session.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.start_trace("main", TraceOptions::default()).await }),
        tokio::spawn(async move { second.start_trace("main", TraceOptions::default()).await }),
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| matches!(r, Ok(Some(_)))).count(), 1);
    assert_eq!(
        results.iter().filter(|r| matches!(r, Err(CoreError::TraceActive))).count(),
        1
    );
    // A single trigger breakpoint was planted
    assert_eq!(fake.session.list_breakpoints().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_trace_slot_is_released_when_planting_fails() {
    let fake = FakeGdb::attached().await;
    assert!(fake
        .session
        .start_trace("no_such_symbol", TraceOptions::default())
        .await
        .unwrap()
        .is_none());
    assert_ok!(fake.session.start_trace("main", TraceOptions::default()).await);
}

#[tokio::test]
async fn test_trace_cancelled_while_stepping() {
    let fake = FakeGdb::attached().await;
    let options = TraceOptions {
        max_steps: 10,
        collect_registers: false,
        ..TraceOptions::default()
    };
    let handle = fake.session.start_trace("main", options).await.unwrap().unwrap();
    let stepping = handle.clone();
    let mut steps = 0;
    fake.set_handler(move |command| {
        if command == "stepi&" {
            steps += 1;
            if steps == 3 {
                stepping.cancel();
            }
        }
        None
    });

    fake.session.continue_inferior().await.unwrap();
    fake.emit(&format!(
        "*stopped,reason=\"breakpoint-hit\",bkptno=\"{}\",thread-id=\"1\"",
        handle.id()
    ));

    let status = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(status, TraceStatus::Canceled);
    assert_eq!(handle.step_count(), 3);
    assert_eq!(handle.tree().unwrap().step_count(), 3);
}

#[tokio::test]
async fn test_exit_tears_the_session_down() {
    let fake = FakeGdb::attached().await;
    let exited = fake.session.process_exit();
    fake.emit("*stopped,reason=\"exited-normally\"");

    assert!(tokio::time::timeout(WAIT, exited.wait()).await.unwrap());
    let info = fake.session.info();
    assert!(!info.initialized);
    assert_eq!(info.status, InferiorStatus::Uninitialized);
    assert_eq!(info.pid, -1);
    assert!(matches!(
        fake.session.execute("info registers").await,
        Err(CoreError::NotInitialized | CoreError::ProcessTerminated)
    ));
}

#[tokio::test]
async fn test_companion_of_a_finished_debugger_is_discarded() {
    let fake = FakeGdb::attached().await;
    let (ours, theirs) = tokio::net::UnixStream::pair().unwrap();
    fake.session
        .set_companion(CompanionChannel::new(ours, WAIT))
        .await;
    // The debugger exits while the request is still being answered
    fake.set_handler(|command| {
        (command == "tracehound-parse-and-eval").then(|| {
            vec![
                "^done".to_string(),
                "(gdb)".to_string(),
                "*stopped,reason=\"exited-normally\"".to_string(),
            ]
        })
    });

    let exited = fake.session.process_exit();
    let extension = tokio::spawn(async move {
        let mut theirs = theirs;
        let _: CompanionRequest = read_frame(&mut theirs).await.unwrap();
        exited.wait().await;
        write_frame(&mut theirs, &CompanionReply::success(json!("1"))).await.unwrap();
        theirs
    });

    let _ = fake.session.parse_and_eval("$rax").await;
    let _theirs = extension.await.unwrap();
    assert!(!fake.session.has_companion().await);
}

#[tokio::test]
async fn test_pointer_chain_reads_four_byte_slots_on_x86() {
    let fake = FakeGdb::connect().await;
    fake.state.lock().unwrap().values.insert("$rax".into(), "void".into());
    fake.session
        .adopt_inferior(std::process::id() as i32)
        .await
        .unwrap();
    assert_eq!(fake.session.arch(), InferiorArch::X86);

    let slots: Box<[u32; 2]> = Box::new([0x1000, 0xdeadbeef]);
    let request = PointerChainRequest {
        base: PointerBase::Address(slots.as_ptr() as u64),
        offsets: vec![4],
    };
    let result = fake
        .session
        .resolve_pointer_chain(&request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.chain, [0x1000, 0x1004]);
}

#[tokio::test]
async fn test_stacktrace_reports_frames_relative_to_stack_pointer() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| match command {
        c if c.contains("(void*)($rsp)") => Some(vec!["^done,value=\"0x7ffc0000\"".to_string()]),
        "bt" => Some(vec![
            console("#0  0x0000000000401000 in main ()\n"),
            console("#1  0x0000000000401100 in _start ()\n"),
            "^done".to_string(),
        ]),
        "info frame 0" => Some(vec![
            console("Stack level 0, frame at 0x7ffc0010:\n rip = 0x401000 in main; saved rip = 0x401100\n"),
            "^done".to_string(),
        ]),
        "info frame 1" => Some(vec![
            console("Stack level 1, frame at 0x7ffc0040:\n rip = 0x401100 in _start\n"),
            "^done".to_string(),
        ]),
        _ => None,
    });

    let trace = fake.session.get_stacktrace_info().await.unwrap();
    assert_eq!(
        trace,
        [
            StackTraceEntry {
                return_address: "0x401100".to_string(),
                frame_address: "0x7ffc0010(rsp+0x10)".to_string(),
            },
            StackTraceEntry {
                return_address: "<>".to_string(),
                frame_address: "0x7ffc0040(rsp+0x40)".to_string(),
            },
        ]
    );
    assert_eq!(
        fake.session.get_stack_frame_return_addresses().await.unwrap(),
        ["0x401100", "<>"]
    );
    assert!(fake
        .session
        .get_stack_frame_info(1)
        .await
        .unwrap()
        .is_some_and(|info| info.contains("frame at 0x7ffc0040")));
    assert_eq!(fake.session.get_stack_frame_info(2).await.unwrap(), None);
}

#[tokio::test]
async fn test_register_flag_rewrites_eflags() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| match command {
        "-data-list-register-names" => {
            Some(vec!["^done,register-names=[\"rax\",\"eflags\"]".to_string()])
        }
        "-data-list-register-values x" => Some(vec![
            "^done,register-values=[{number=\"0\",value=\"0x1\"},{number=\"1\",value=\"0x246\"}]"
                .to_string(),
        ]),
        _ => None,
    });

    let registers = fake.session.read_registers().await.unwrap();
    assert_eq!(registers["zf"], "1");
    assert_eq!(registers["cf"], "0");

    assert!(fake.session.set_register_flag("cf", true).await.unwrap());
    assert!(fake.commands().iter().any(|c| c == "set $eflags=0x247"));
    assert!(!fake.session.set_register_flag("xf", true).await.unwrap());
}

#[tokio::test]
async fn test_failed_assignment_is_reported() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| {
        (command == "set $nosuch=1").then(|| vec!["^error,msg=\"Invalid cast.\"".to_string()])
    });
    assert_ok!(fake.session.set_convenience_variable("rax", "0x10").await);
    assert!(matches!(
        fake.session.set_convenience_variable("nosuch", "1").await,
        Err(CoreError::CommandError(msg)) if msg == "Invalid cast."
    ));
}

#[tokio::test]
async fn test_float_registers_without_companion() {
    let fake = FakeGdb::attached().await;
    fake.state
        .lock()
        .unwrap()
        .values
        .insert("$st0".into(), "1.5".into());
    let registers = fake.session.read_float_registers().await.unwrap();
    assert_eq!(registers.len(), 16);
    assert_eq!(registers["st0"], "1.5");
    assert!(fake
        .commands()
        .contains(&"-data-evaluate-expression \"$xmm7.v4_float\"".to_string()));
}

#[tokio::test]
async fn test_function_search_restores_case_sensitivity() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| {
        (command == "info functions init").then(|| {
            vec![
                console("Non-debugging symbols:\n"),
                console("0x0000000000401000  _init\n"),
                "^done".to_string(),
            ]
        })
    });
    let functions = fake.session.search_functions("init", false).await.unwrap();
    assert_eq!(
        functions,
        [FunctionSymbol {
            address: Some(0x401000),
            name: "_init".to_string(),
        }]
    );
    let commands = fake.commands();
    let searched = commands.iter().position(|c| c == "info functions init").unwrap();
    assert_eq!(commands[searched - 1], "set case-sensitive off");
    assert_eq!(commands[searched + 1], "set case-sensitive auto");
}

#[tokio::test]
async fn test_thread_and_symbol_queries() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| match command {
        "info threads" => Some(vec![
            console("  Id   Target Id                          Frame \n"),
            console("* 1    Thread 0x7f01 (LWP 4242) \"app\" main () at app.c:3\n"),
            "^done".to_string(),
        ]),
        "info symbol 0x401000" => Some(vec![
            console("main in section .text\n"),
            "^done".to_string(),
        ]),
        "info address main" => Some(vec![
            console("Symbol \"main\" is at 0x401000 in a file compiled without debugging.\n"),
            "^done".to_string(),
        ]),
        _ => None,
    });
    assert_eq!(
        fake.session.get_thread_info().await.unwrap().as_deref(),
        Some("Thread 0x7f01 (LWP 4242) \"app\" main () at app.c:3")
    );
    assert_eq!(
        fake.session.get_address_info("0x401000").await.unwrap(),
        "main in section .text\n"
    );
    assert!(fake
        .session
        .get_symbol_info("main")
        .await
        .unwrap()
        .starts_with("Symbol \"main\" is at 0x401000"));
}

#[tokio::test]
async fn test_closest_instruction_after_address() {
    let fake = FakeGdb::attached().await;
    fake.set_handler(|command| {
        (command == "disas /r 0x401000,+60").then(|| {
            vec![
                console("Dump of assembler code from 0x401000 to 0x40103c:\n"),
                console("   0x0000000000401000 <main+0>:\t55\tpush   %rbp\n"),
                console("   0x0000000000401001 <main+1>:\t48 89 e5\tmov    %rsp,%rbp\n"),
                console("   0x0000000000401004 <main+4>:\tc3\tret\n"),
                console("End of assembler dump.\n"),
                "^done".to_string(),
            ]
        })
    });
    let next = fake
        .session
        .find_closest_instruction_address(ENTRY, InstructionLocation::Next, 2)
        .await
        .unwrap();
    assert_eq!(next, Some(0x401004));
}
