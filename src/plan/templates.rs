//! Plan templates — typed dispatch from task type to step list.
//!
//! Exactly the step(s) performing an irreversible external effect are gated
//! on approval. Task types without a dedicated template get the generic
//! breakdown.

use crate::plan::{Step, StepAction};
use crate::task::model::TaskType;

/// Produce the ordered step list for a task type.
pub fn steps_for(task_type: TaskType) -> Vec<Step> {
    match task_type {
        TaskType::Email => vec![
            Step::new("analyze_email", StepAction::Review, "Read and understand the email content"),
            Step::new("determine_response", StepAction::Review, "Decide whether a reply is needed and what to say"),
            Step::new("draft_reply", StepAction::Draft, "Draft the reply and request approval to send it").gated(),
            Step::new("confirm_delivery", StepAction::Verify, "Confirm the approved reply was dispatched"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
        TaskType::LinkedIn => vec![
            Step::new("review_notification", StepAction::Review, "Understand what the notification is about"),
            Step::new("determine_action", StepAction::Review, "Decide the appropriate response"),
            Step::new("draft_response", StepAction::Draft, "Draft the response or post and request approval").gated(),
            Step::new("confirm_publication", StepAction::Verify, "Confirm the approved content was published"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
        TaskType::SocialPost => vec![
            Step::new("compose_post", StepAction::Review, "Compose the post content"),
            Step::new("draft_post", StepAction::Draft, "Request approval to publish the post").gated(),
            Step::new("confirm_publication", StepAction::Verify, "Confirm the approved post went out"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
        TaskType::WhatsApp => vec![
            Step::new("read_message", StepAction::Review, "Read and understand the message"),
            Step::new("determine_response", StepAction::Review, "Decide whether and how to respond"),
            Step::new("draft_reply", StepAction::Draft, "Draft the reply and request approval to send it").gated(),
            Step::new("confirm_delivery", StepAction::Verify, "Confirm the approved reply was sent"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
        TaskType::ClientInquiry => vec![
            Step::new("analyze_inquiry", StepAction::Review, "Understand the client's needs and scope"),
            Step::new("check_handbook", StepAction::Review, "Review pricing and service references"),
            Step::new("prepare_proposal", StepAction::Draft, "Draft the proposal and request approval to send it").gated(),
            Step::new("schedule_follow_up", StepAction::FollowUp, "Enqueue a follow-up reminder task"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
        TaskType::Invoice => vec![
            Step::new("gather_details", StepAction::Review, "Collect amounts, recipient, and line items"),
            Step::new("prepare_invoice", StepAction::Draft, "Draft the invoice and request approval to post it").gated(),
            Step::new("record_outcome", StepAction::Verify, "Confirm the invoice was posted"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
        TaskType::Generic => vec![
            Step::new("analyze_task", StepAction::Review, "Understand what needs to be done"),
            Step::new("plan_approach", StepAction::Review, "Determine the best way to complete it"),
            Step::new("execute", StepAction::Invoke, "Perform the work via the registered handler"),
            Step::new("verify", StepAction::Verify, "Confirm the work is complete"),
            Step::new("archive", StepAction::Verify, "Record the outcome"),
        ],
    }
}
