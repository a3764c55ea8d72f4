use std::{env, process};

use launchdarkly_server_sdk_alt::{DefaultClient, FlagsStateOptions, User};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 3 {
        eprintln!("Please pass a token and a user key as arguments");
        process::exit(1);
    }
    let token = &args[1];
    let user = User::new(args[2].clone());

    let mut client = DefaultClient::with_token(token.clone()).expect("invalid configuration");
    if let Err(error) = client.start().await {
        eprintln!("failed to start: {}", error);
    }

    let state = client.all_flags_state(&user, FlagsStateOptions::default());
    println!(
        "{}",
        serde_json::to_string_pretty(&state).expect("serializing flag state")
    );
    client.close().await;
}
