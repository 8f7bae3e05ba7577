// Interactive softphone running against the in-process loopback stack

use std::sync::Arc;

use rs_softphone::loopback::{LoopbackAudio, LoopbackStack};
use rs_softphone::prelude::*;
use rs_softphone::{init_tracing, RegistrationState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_tracing("rs_softphone=info");

    println!("Rust Softphone v{}", rs_softphone::VERSION);
    println!("=====================\n");

    let config = SoftphoneConfig::from_env();
    let stack = LoopbackStack::new();
    let phone = Softphone::builder(Arc::new(stack.clone()), Arc::new(LoopbackAudio::new()))
        .config(config.clone())
        .build();

    load_devices(&phone, &config).await;
    let snapshot = phone.snapshot();
    for (i, device) in snapshot.devices().iter().enumerate() {
        println!("  [{}] {} <{}>", i, device.name, device.sip_uri);
    }

    tokio::spawn(print_changes(phone.subscribe()));

    // Dialer: pre-fills whatever number was requested elsewhere
    let mut dial_requests = phone.dial_requests();
    let dialer = phone.clone();
    tokio::spawn(async move {
        while let Some(request) = dial_requests.recv().await {
            println!("\n*** Dialing {} ***", request.number);
            dialer.make_call(&request.number).await;
        }
    });

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    print_help();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            continue;
        };

        match *command {
            "select" => match parts.get(1).and_then(|i| i.parse::<usize>().ok()) {
                Some(index) => match phone.snapshot().devices().get(index).cloned() {
                    Some(device) => phone.select_device(device).await,
                    None => println!("No device #{}", index),
                },
                None => println!("Usage: select <index>"),
            },
            "register" => phone.register().await,
            "unregister" => phone.unregister().await,
            "call" => match parts.get(1) {
                Some(target) => phone.make_call(target).await,
                None => println!("Usage: call <number>"),
            },
            "dial" => match parts.get(1) {
                Some(number) => {
                    phone.dial_number(number);
                }
                None => println!("Usage: dial <number>"),
            },
            "answer" => phone.answer_call().await,
            "hangup" => phone.hangup_call().await,
            "mute" => phone.toggle_mute().await,
            "hold" => phone.toggle_hold().await,
            "dtmf" => match parts.get(1) {
                Some(digits) => {
                    for digit in digits.chars() {
                        phone.send_dtmf(&digit.to_string()).await;
                    }
                }
                None => println!("Usage: dtmf <digits>"),
            },
            "ring" => {
                let from = parts.get(1).copied().unwrap_or("2000");
                if stack.incoming_call(from).is_none() {
                    println!("Register first");
                }
            }
            "pickup" => match stack.last_session() {
                Some(session) => session.remote_answer(),
                None => println!("No call"),
            },
            "drop" => match stack.last_session() {
                Some(session) => session.remote_hangup(),
                None => println!("No call"),
            },
            "autoanswer" => {
                let on = parts.get(1).is_some_and(|v| *v == "on");
                stack.set_auto_answer(on);
                println!("Auto answer {}", if on { "on" } else { "off" });
            }
            "status" => print_status(&phone.snapshot()),
            "clear" => phone.clear_error(),
            "help" => print_help(),
            "quit" | "exit" => {
                println!("Shutting down...");
                break;
            }
            other => println!("Unknown command: {}", other),
        }
    }

    phone.shutdown().await;
    println!("Goodbye!");
    Ok(())
}

async fn load_devices(phone: &Softphone, config: &SoftphoneConfig) {
    #[cfg(feature = "serialization")]
    if let Some(path) = &config.devices_file {
        phone
            .refresh_devices(&rs_softphone::JsonFileDevices::new(path))
            .await;
        return;
    }
    let _ = config;
    phone.refresh_devices(&StaticDevices(demo_devices())).await;
}

fn demo_devices() -> Vec<Device> {
    ["1001", "1002"]
        .iter()
        .map(|ext| Device {
            id: format!("demo-{}", ext),
            name: format!("Demo extension {}", ext),
            sip_uri: format!("sip:{}@demo.local", ext),
            username: ext.to_string(),
            password: ext.to_string(),
            domain: "demo.local".to_string(),
            wss_url: "wss://demo.local:7443".to_string(),
        })
        .collect()
}

async fn print_changes(mut rx: watch::Receiver<SoftphoneSnapshot>) {
    let mut last = rx.borrow_and_update().clone();
    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        if current.registration_state != last.registration_state {
            println!("\n*** Registration: {} ***", current.registration_state);
        }
        if current.call.state != last.call.state {
            match (&current.call.remote_identity, current.call.direction) {
                (Some(who), Some(direction)) => {
                    println!("\n*** Call {:?} {} : {} ***", direction, who, current.call.state)
                }
                _ => println!("\n*** Call: {} ***", current.call.state),
            }
        }
        if current.error != last.error {
            if let Some(error) = &current.error {
                println!("\n*** Error: {} ***", error);
            }
        }
        last = current;
    }
}

fn print_status(snapshot: &SoftphoneSnapshot) {
    match snapshot.selected_device() {
        Some(device) => println!("Device: {} <{}>", device.name, device.sip_uri),
        None => println!("Device: none"),
    }
    println!(
        "Registration: {} ({})",
        snapshot.registration_state,
        snapshot.registration_state.status_color()
    );
    let call = &snapshot.call;
    if call.is_idle() {
        println!("No active call");
    } else {
        println!(
            "Call: {} {} [{}]{}{}",
            call.state,
            call.remote_identity.as_deref().unwrap_or("Unknown"),
            format_duration(call.duration),
            if call.is_muted { " muted" } else { "" },
            if call.is_on_hold { " on hold" } else { "" },
        );
    }
    if snapshot.registration_state == RegistrationState::Failed {
        println!("Use 'register' to retry");
    }
    if let Some(error) = &snapshot.error {
        println!("Last error: {}", error);
    }
}

fn print_help() {
    println!("\nCommands:");
    println!("  select <n>      - Select device n");
    println!("  register        - Register the selected device");
    println!("  unregister      - Unregister");
    println!("  call <number>   - Call a number at the device's domain");
    println!("  dial <number>   - Send a dial request to the dialer");
    println!("  answer          - Answer the ringing call");
    println!("  hangup          - Hang up / cancel / reject");
    println!("  mute | hold     - Toggle mute or hold");
    println!("  dtmf <digits>   - Send DTMF");
    println!("  ring [from]     - Simulate an incoming call");
    println!("  pickup | drop   - Far end answers or hangs up");
    println!("  autoanswer on|off");
    println!("  status | clear | help | quit");
}
