use std::path::PathBuf;
use std::process::Command;
use std::{env, fs};

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();

    let input_path = PathBuf::from("assets/shaders/");
    println!("cargo:rerun-if-changed={}", input_path.to_string_lossy());
    // The renderer reads its SPIR-V from here unless the config points elsewhere
    println!("cargo:rustc-env=MIRAGE_SHADER_DIR={}", out_dir);

    let paths = match fs::read_dir(&input_path) {
        Ok(paths) => paths,
        Err(e) => {
            println!("cargo:warning=No shader sources found: {}", e);
            return;
        }
    };

    compile_shaders(paths, PathBuf::new(), out_dir);
}

fn compile_shaders(paths: fs::ReadDir, parent_path: PathBuf, out_dir: String) {
    for entry in paths {
        let entry = match entry {
            Ok(path) => path,
            Err(_) => continue,
        };
        let shader_file_name = entry.file_name();
        let shader_path = entry.path();
        if shader_path.is_dir() {
            let mut child_path = parent_path.clone();
            child_path.push(shader_file_name);
            if let Ok(child_paths) = fs::read_dir(shader_path) {
                compile_shaders(child_paths, child_path, out_dir.clone());
            }
            continue;
        }
        if !shader_path.is_file() {
            continue;
        }

        let mut input_path = PathBuf::new();
        input_path.push("assets");
        input_path.push("shaders");
        input_path.push(&parent_path);
        input_path.push(&shader_file_name);

        let mut output_file_name = shader_file_name.clone();
        output_file_name.push(".spv");
        let mut output_path = PathBuf::new();
        output_path.push(&out_dir);
        output_path.push(&output_file_name);

        let shader_file_name = shader_file_name.to_string_lossy();
        // glslc can't automatically create directories, so we're just going to pick a flat structure.
        // Ray tracing stages need at least SPIR-V 1.4, hence the explicit target environment.
        let shader_compile_result = Command::new("glslc")
            .arg("--target-env=vulkan1.3")
            .arg(&input_path)
            .arg("-o")
            .arg(&output_path)
            .status();

        match shader_compile_result {
            Ok(status) if status.success() => {}
            Ok(status) => panic!(
                "Shader compilation for {} failed: {}",
                shader_file_name, status
            ),
            Err(e) => {
                // Without glslc the crate still builds, the renderer then fails at startup
                // with a missing shader file
                println!(
                    "cargo:warning=Could not run glslc for {}: {}",
                    shader_file_name, e
                );
            }
        }
    }
}
