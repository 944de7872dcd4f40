//! Seal command - seals stdin or a file to `<output>.prv`/`<output>.pub`

use super::{read_input, CommandResult};
use std::path::Path;
use vault_tpm::{ParentPolicy, SealRequest, TpmEngine};

pub fn execute(
    engine: &TpmEngine,
    input: Option<&Path>,
    output: &Path,
    template: Option<&str>,
    parent_policy: ParentPolicy,
) -> CommandResult {
    let secret = read_input(input)?;

    let mut request = SealRequest::new(secret.to_vec(), output).with_parent_policy(parent_policy);
    if let Some(template) = template {
        request = request.with_template(template);
    }

    let outcome = engine.seal(&request)?;
    let action = if outcome.primary_created {
        "created"
    } else {
        "reused"
    };
    Ok(format!(
        "Sealed {} bytes to {} (parent {} {}, {})",
        request.secret().len(),
        output.display(),
        outcome.parent,
        action,
        outcome.template
    ))
}
