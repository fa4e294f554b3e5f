//! Echo 能力（测试与演练用）

use async_trait::async_trait;

use crate::abilities::{Ability, AbilityError, AbilityOutput, AbilityRequest};

/// Echo 能力：原样返回任务描述，不产生用量
pub struct EchoAbility;

#[async_trait]
impl Ability for EchoAbility {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the task description unchanged (dry runs and testing)."
    }

    async fn invoke(&self, request: AbilityRequest) -> Result<AbilityOutput, AbilityError> {
        Ok(AbilityOutput::text(request.instruction))
    }
}
