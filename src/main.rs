// REPL binary - read, eval, print, loop.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use steplisp::vm::VM;

const HISTORY_FILE: &str = "steplisp_history.txt";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("StepLisp v0.1.0 - sequencer scripting REPL");
    println!("Type exit or Ctrl+D to quit");
    println!();

    let mut vm = VM::new();
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(HISTORY_FILE);

    loop {
        match rl.readline("steplisp> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" || line == "(exit)" {
                    println!("Goodbye!");
                    break;
                }
                rl.add_history_entry(line)?;

                // Errors are fatal to the expression, never to the session.
                match vm.eval(line) {
                    Ok(value) => println!("=> {}", vm.render(value)),
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }

    let _ = rl.save_history(HISTORY_FILE);
    Ok(())
}
