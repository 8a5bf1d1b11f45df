// Invokes the offline shader compiler (glslc, from the Vulkan SDK) for
// every GLSL source under shaders/. The engine only ever reads the
// compiled .spv blobs, so a missing compiler degrades to a warning and
// pre-built blobs keep working.

use std::fs;
use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    let Ok(entries) = fs::read_dir("shaders") else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_stage = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("vert" | "frag")
        );
        if is_stage {
            let output = format!("{}.spv", path.display());
            compile_shader(&path, Path::new(&output));
        }
    }
}

fn compile_shader(input: &Path, output: &Path) {
    let result = Command::new("glslc").arg(input).arg("-o").arg(output).status();

    match result {
        Ok(status) if status.success() => {
            println!("compiled {} -> {}", input.display(), output.display());
        }
        Ok(status) => {
            panic!(
                "failed to compile {}: exit code {:?}",
                input.display(),
                status.code()
            );
        }
        Err(e) => {
            eprintln!("warning: glslc not found ({e})");
            eprintln!(
                "shaders were not rebuilt; compile manually with: glslc {} -o {}",
                input.display(),
                output.display()
            );
        }
    }
}
