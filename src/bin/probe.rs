//! Host capability probe: reports which decoders this machine can run.

use gridstream::gpu::CudaContextService;
use gridstream::DecoderFactory;
use std::env;

fn main() {
    gridstream::init_logging();

    let args: Vec<String> = env::args().collect();
    let json = args.iter().any(|a| a == "--json");

    let gpu = CudaContextService::new(0);
    let caps = DecoderFactory::capabilities(&gpu);

    if json {
        match serde_json::to_string_pretty(&caps) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("failed to serialize capabilities: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    println!("gridstream {} capability probe", gridstream::VERSION);
    println!("  hardware decode: {}", yes_no(caps.hardware_available));
    if caps.hardware_available {
        println!("  CUDA devices:    {}", caps.device_count);
        if let Some(name) = &caps.device_name {
            println!("  device 0:        {}", name);
        }
        if let Some(total) = gpu.device_total_memory() {
            println!("  device memory:   {} MB", total / (1024 * 1024));
        }
    }
    println!("  software decode: {}", yes_no(caps.software_available));
    println!("  recommendation:  {}", caps.recommendation);
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
