mod layout_edits;
