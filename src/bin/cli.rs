//! Command-line interface for the kv-cache crate.
//!
//! Provides cache geometry inspection and a small placement simulator that
//! prints the observer view after each step.

use kv_cache::{
    get_padding, CacheParams, Dtype, KvCache, KvCacheView, MicroBatch, ModelMetadata,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("info") => cmd_info(&args[2..]),
        Some("simulate") => cmd_simulate(&args[2..]),
        Some("--help") | Some("-h") => print_help(),
        Some("--version") | Some("-V") => print_version(),
        None => print_help(),
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}");
            eprintln!("Run 'kvcache-cli --help' for usage.");
            std::process::exit(1);
        }
    }
}

fn print_version() {
    println!("kv-cache v{}", kv_cache::VERSION);
}

fn print_help() {
    print_version();
    println!("Key-value attention cache for LLM inference");
    println!();
    println!("USAGE:");
    println!("    kvcache-cli <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    info [preset] [dtype]   Show cache geometry for a model preset");
    println!("    simulate                Run a small placement scenario and print the view");
    println!();
    println!("PRESETS:");
    println!("    llama3-8b (default), mamba-130m");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help");
    println!("    -V, --version    Print version");
}

/// Show the tensor geometry a preset model would get.
fn cmd_info(args: &[String]) {
    let preset = args.first().map(|s| s.as_str()).unwrap_or("llama3-8b");
    let model = match preset {
        "llama3-8b" => ModelMetadata::llama3_8b(),
        "mamba-130m" => ModelMetadata::mamba_130m(),
        other => {
            eprintln!("Unknown model preset: {other}");
            eprintln!("Available: llama3-8b, mamba-130m");
            std::process::exit(1);
        }
    };

    let dtype = match args.get(1).map(|s| s.as_str()) {
        None => Dtype::F16,
        Some(name) => match Dtype::parse(name) {
            Some(d) => d,
            None => {
                eprintln!("Unknown dtype: {name} (expected f16, bf16, or f32)");
                std::process::exit(1);
            }
        },
    };

    let kv_size = if model.is_recurrent() { 8 } else { 4096 };
    let params = CacheParams {
        type_k: dtype,
        type_v: dtype,
        kv_size,
        offload: false,
        flash_attn: false,
    };

    let cache = match KvCache::new(&model, &params) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Failed to build cache: {e}");
            std::process::exit(1);
        }
    };

    println!("Cache geometry for {preset}");
    println!("{}", "=".repeat(50));
    println!("Cells:           {}", cache.size());
    println!("Layers:          {}", cache.k_l().len());
    println!("K dtype:         {}", cache.type_k());
    println!("V dtype:         {}", cache.type_v());
    println!("Recurrent:       {}", cache.is_recurrent());
    println!("Can shift:       {}", cache.can_shift());
    println!("V transposed:    {}", cache.v_trans());
    println!("Buffers:         {}", cache.buffers().len());
    println!(
        "Total size:      {:.2} MiB",
        cache.total_size() as f64 / 1024.0 / 1024.0
    );
    println!("Slot padding:    {}", get_padding(params.flash_attn));
}

/// Place a few batches, mutate some sequences, and print the view each step.
fn cmd_simulate(_args: &[String]) {
    let model = ModelMetadata {
        n_layer: 1,
        n_head_kv: 1,
        head_dim: 4,
        ..ModelMetadata::llama3_8b()
    };
    let params = CacheParams {
        kv_size: 16,
        ..CacheParams::default()
    };
    let mut cache = match KvCache::new(&model, &params) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Failed to build cache: {e}");
            std::process::exit(1);
        }
    };
    let mut view = KvCacheView::new(4);

    step("prefill sequence 0 with 6 tokens", &mut cache, &mut view, |kv| {
        let batch = MicroBatch::for_sequence(0, &[0, 1, 2, 3, 4, 5]);
        if let Err(e) = kv.find_slot(&batch) {
            eprintln!("placement failed: {e}");
        }
    });
    step("prefill sequence 1 with 4 tokens", &mut cache, &mut view, |kv| {
        let batch = MicroBatch::for_sequence(1, &[0, 1, 2, 3]);
        if let Err(e) = kv.find_slot(&batch) {
            eprintln!("placement failed: {e}");
        }
    });
    step("fork sequence 0 into sequence 2", &mut cache, &mut view, |kv| {
        kv.seq_cp(0, 2, -1, -1);
    });
    step("drop the first half of sequence 0", &mut cache, &mut view, |kv| {
        if let Err(e) = kv.seq_rm(0, 0, 3) {
            eprintln!("removal failed: {e}");
        }
    });
    step("shift sequence 1 forward by 8", &mut cache, &mut view, |kv| {
        kv.seq_add(1, 0, 4, 8);
    });
}

fn step(what: &str, cache: &mut KvCache, view: &mut KvCacheView, op: impl FnOnce(&mut KvCache)) {
    println!("==> {what}");
    op(cache);
    view.update(cache);
    print_view(view);
    println!();
}

fn print_view(view: &KvCacheView) {
    println!(
        "cells = {}, used = {}, tokens = {}, best run = {} @ {}",
        view.n_cells,
        view.used_cells,
        view.token_count,
        view.max_contiguous,
        view.max_contiguous_idx
    );
    for i in 0..view.n_cells {
        let seqs: Vec<String> = view
            .cell_sequences(i)
            .iter()
            .filter(|&&s| s >= 0)
            .map(|s| s.to_string())
            .collect();
        if seqs.is_empty() {
            continue;
        }
        println!(
            "  cell {i:>3}: pos = {:>4}, seqs = [{}]",
            view.cells[i].pos,
            seqs.join(", ")
        );
    }
}
