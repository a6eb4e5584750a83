use vergen_gitcl::{BuildBuilder, CargoBuilder, Emitter, GitclBuilder, RustcBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let build = BuildBuilder::all_build()?;
    let cargo = CargoBuilder::all_cargo()?;
    let rustc = RustcBuilder::all_rustc()?;

    let mut emitter = Emitter::default();
    emitter
        .add_instructions(&build)?
        .add_instructions(&cargo)?
        .add_instructions(&rustc)?;

    // Outside a git checkout (source tarballs, container builds) take the
    // values from the environment instead
    match GitclBuilder::all_git() {
        Ok(git) => {
            emitter.add_instructions(&git)?;
        }
        Err(_) => {
            for (var, fallback) in [("VERGEN_GIT_SHA", "unknown"), ("VERGEN_GIT_DIRTY", "false")] {
                println!(
                    "cargo::rustc-env={}={}",
                    var,
                    std::env::var(var).unwrap_or_else(|_| fallback.to_string())
                );
            }
        }
    }

    emitter.emit()?;

    Ok(())
}
